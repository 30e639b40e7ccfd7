use crate::buffer::SendQueue;
use crate::config::Config;
use crate::dispatch::{Delivery, IoMode, Pending, ReplyCallback, Table};
use crate::frame::{self, Assembler};
use crate::shared::{ErrorType, ErrorUtils, NetworkError, NetworkResult};
use crate::vector::{self, VectorMessage, VECTOR_HEADER_SIZE};
use mio::net::TcpStream;
use photon::logging;
use std::io;
use std::io::Read;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

const POLL_TOKEN: mio::Token = mio::Token(0);
const ZERO_TIME: Duration = Duration::from_secs(0);
// Upper bound on how long a parked waiter sleeps between rechecks, so a
// missed wakeup can only ever delay a waiter, never strand it.
const PARK_INTERVAL: Duration = Duration::from_millis(25);

/// Result of a mode-governed send. `reply` is populated for `IoMode::Block`
/// and absent for every other mode.
#[derive(Debug)]
pub struct SendOutcome {
    pub vector: u64,
    pub reply: Option<VectorMessage>,
}

/// Bidirectional messaging endpoint wrapping one connected stream. Either
/// side of a link uses the same type.
///
/// Four layers are exposed: raw buffered bytes (`send_bytes`), length-framed
/// messages (`send_message`), vector-tagged messages (`send_vector`) and the
/// mode-governed request/response surface (`send_vector_with_mode` plus
/// `service`).
///
/// The endpoint is shared freely between threads. The readiness poll lives
/// behind the dispatcher mutex, held by the single caller driving I/O,
/// including across the blocking wait. Stream, receive assembler and
/// outbound queue live behind the endpoint mutex, which is only ever held
/// for non-blocking work, so senders are never stuck behind a blocked
/// dispatcher. Waiters park on the correlation table's condition and pick up
/// replies deposited for them without re-entering the socket. Callbacks run
/// on the dispatching thread under the endpoint mutex and must not call back
/// into the endpoint.
pub struct Endpoint {
    poller: Mutex<Poller>,
    conn: Mutex<Conn>,
    table: Mutex<Table>,
    ready: Condvar,
    vector: Mutex<u64>,
    lost: AtomicBool,
    closed: AtomicBool,
    config: Config,
    log: logging::Logger,
}

struct Poller {
    poll: mio::Poll,
    events: mio::Events,
}

struct Conn {
    stream: TcpStream,
    assembler: Assembler,
    outbound: SendQueue,
    scratch: Vec<u8>,
}

impl Endpoint {
    /// Wraps a connected non-blocking stream and registers it for readiness
    /// events.
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(
        stream: TcpStream,
        config: Config,
        log: L,
    ) -> NetworkResult<Endpoint> {
        let endpoint_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::Logger::root(logging::Discard, logging::o!()),
        };

        let poll = mio::Poll::new()?;

        poll.register(
            &stream,
            POLL_TOKEN,
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )?;

        logging::debug!(endpoint_log, "endpoint created";
                        "context" => "new",
                        "peer" => ?stream.peer_addr());

        Ok(Endpoint {
            poller: Mutex::new(Poller {
                poll,
                events: mio::Events::with_capacity(config.events_capacity),
            }),
            conn: Mutex::new(Conn {
                stream,
                assembler: Assembler::new(config.max_frame_size),
                outbound: SendQueue::new(),
                scratch: vec![0; config.read_chunk_size],
            }),
            table: Mutex::new(Table::new()),
            ready: Condvar::new(),
            // Vector zero is reserved to mean "not a reply", so allocation
            // starts at one.
            vector: Mutex::new(1),
            lost: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            config,
            log: endpoint_log,
        })
    }

    /// Appends raw bytes to the outbound queue and drains it as far as the
    /// socket allows. Never blocks on the network; pass `None` to drain
    /// without appending.
    pub fn send_bytes<'a, D: Into<Option<&'a [u8]>>>(&self, data: D) -> NetworkResult<()> {
        self.guard()?;

        let mut conn = self.conn_lock();

        if let Some(data) = data.into() {
            conn.outbound.push(data.to_vec());
            logging::trace!(self.log, "bytes queued";
                            "context" => "send_bytes",
                            "count" => data.len(),
                            "queued" => conn.outbound.len());
        }

        self.drain_outbound(&mut conn)
    }

    /// Total queued outbound bytes, used as the back-pressure signal. Callers pause
    /// upstream production while this is above their threshold.
    pub fn out_buffer_size(&self) -> usize {
        self.conn_lock().outbound.len()
    }

    /// Frames the payload and queues it as a single chunk.
    pub fn send_message(&self, payload: &[u8]) -> NetworkResult<()> {
        self.guard()?;

        if payload.len() > self.config.max_frame_size {
            return Err(NetworkError::Fatal(ErrorType::FrameTooLarge));
        }

        let mut conn = self.conn_lock();

        conn.outbound.push(frame::encode(payload));

        self.drain_outbound(&mut conn)
    }

    /// Returns one complete message, optionally feeding bytes read elsewhere
    /// into the assembler first. Never reads the socket; that is the
    /// dispatcher's job.
    pub fn try_pop_message<'a, D: Into<Option<&'a [u8]>>>(
        &self,
        feed: D,
    ) -> NetworkResult<Option<Vec<u8>>> {
        self.guard()?;

        let mut conn = self.conn_lock();

        if let Some(feed) = feed.into() {
            conn.assembler.feed(feed);
        }

        conn.assembler.try_pop().map_err(|err| self.fail(err))
    }

    /// Returns all complete messages currently assembled.
    pub fn drain_messages<'a, D: Into<Option<&'a [u8]>>>(
        &self,
        feed: D,
    ) -> NetworkResult<Vec<Vec<u8>>> {
        self.guard()?;

        let mut conn = self.conn_lock();

        if let Some(feed) = feed.into() {
            conn.assembler.feed(feed);
        }

        let mut messages = Vec::new();

        while let Some(message) = conn.assembler.try_pop().map_err(|err| self.fail(err))? {
            messages.push(message);
        }

        Ok(messages)
    }

    /// Allocates the next send vector and emits the message. Allocation and
    /// enqueue form one critical section, so vectors are strictly monotonic
    /// and frames hit the queue in vector order.
    pub fn send_vector(&self, payload: &[u8], rvector: u64) -> NetworkResult<u64> {
        self.guard()?;

        let mut conn = self.conn_lock();

        if VECTOR_HEADER_SIZE + payload.len() > self.config.max_frame_size {
            return Err(NetworkError::Fatal(ErrorType::FrameTooLarge));
        }

        let vector = self.alloc_vector();

        conn.outbound.push(vector::encode_message(vector, rvector, payload));
        logging::trace!(self.log, "vector message queued";
                        "context" => "send_vector",
                        "vector" => vector,
                        "rvector" => rvector,
                        "size" => payload.len());

        self.drain_outbound(&mut conn)?;

        Ok(vector)
    }

    /// Returns one vector message, optionally feeding externally read bytes.
    pub fn try_pop_vector<'a, D: Into<Option<&'a [u8]>>>(
        &self,
        feed: D,
    ) -> NetworkResult<Option<VectorMessage>> {
        self.guard()?;

        let mut conn = self.conn_lock();
        let feed = feed.into();

        self.pop_vector_locked(&mut conn, feed)
    }

    /// Returns all vector messages currently assembled.
    pub fn drain_vectors<'a, D: Into<Option<&'a [u8]>>>(
        &self,
        feed: D,
    ) -> NetworkResult<Vec<VectorMessage>> {
        self.guard()?;

        let mut conn = self.conn_lock();

        if let Some(feed) = feed.into() {
            conn.assembler.feed(feed);
        }

        let mut messages = Vec::new();

        while let Some(message) = self.pop_vector_locked(&mut conn, None)? {
            messages.push(message);
        }

        Ok(messages)
    }

    /// Sends a vector message under the given I/O mode.
    ///
    /// For `Block` and `Async` the reply is awaited or stored; for
    /// `Callback` the supplied callback fires on the dispatching thread when
    /// the reply arrives; for `Discard` any reply is dropped. The pending
    /// entry is registered before the frame can reach the wire, so a reply
    /// can never race past its own bookkeeping.
    pub fn send_vector_with_mode(
        &self,
        payload: &[u8],
        rvector: u64,
        mode: IoMode,
        callback: Option<ReplyCallback>,
    ) -> NetworkResult<SendOutcome> {
        self.guard()?;

        if mode == IoMode::Callback && callback.is_none() {
            return Err(NetworkError::Fatal(ErrorType::CallbackRequired));
        }

        let vector = {
            let mut conn = self.conn_lock();

            if VECTOR_HEADER_SIZE + payload.len() > self.config.max_frame_size {
                return Err(NetworkError::Fatal(ErrorType::FrameTooLarge));
            }

            let vector = self.alloc_vector();

            match mode {
                IoMode::Block | IoMode::Async => {
                    self.table_lock().register(vector, Pending::AwaitedEmpty)
                }
                IoMode::Callback => {
                    if let Some(callback) = callback {
                        self.table_lock().register(vector, Pending::Callback(callback));
                    }
                }
                IoMode::Discard => (),
            }

            conn.outbound.push(vector::encode_message(vector, rvector, payload));
            logging::trace!(self.log, "vector message queued";
                            "context" => "send_vector_with_mode",
                            "vector" => vector,
                            "rvector" => rvector,
                            "mode" => ?mode,
                            "size" => payload.len());

            self.drain_outbound(&mut conn)?;

            vector
        };

        let reply = match mode {
            IoMode::Block => Some(self.wait_for(vector)?),
            _ => None,
        };

        Ok(SendOutcome { vector, reply })
    }

    /// Runs dispatch cycles on behalf of all callers.
    ///
    /// With `await_vector` set, a reply already deposited for it is returned
    /// immediately without touching the socket. Otherwise one readiness
    /// cycle runs: read everything available, drain pending output, then
    /// classify every complete vector message as matched to `await_vector`,
    /// stored for an awaiting entry, handed to a callback, or discarded.
    /// Non-blocking calls return after one cycle; blocking calls loop until
    /// a match arrives or the connection is lost.
    pub fn service<A: Into<Option<u64>>>(
        &self,
        await_vector: A,
        block: bool,
    ) -> NetworkResult<Option<VectorMessage>> {
        self.service_inner(await_vector.into(), block, None)
    }

    /// Blocks until the reply for `vector` arrives.
    pub fn wait_for(&self, vector: u64) -> NetworkResult<VectorMessage> {
        match self.service_inner(Some(vector), true, None)? {
            Some(message) => Ok(message),
            // A blocking wait only comes back empty once the stream is gone.
            None => Err(NetworkError::Fatal(ErrorType::ConnectionLost)),
        }
    }

    /// Blocks until the reply for `vector` arrives or the timeout expires.
    /// On expiry the pending entry stays registered, so a later wait can
    /// still collect the reply.
    pub fn wait_for_deadline(
        &self,
        vector: u64,
        timeout: Duration,
    ) -> NetworkResult<Option<VectorMessage>> {
        self.service_inner(Some(vector), true, Some(Instant::now() + timeout))
    }

    /// Drops the pending entry for an abandoned request. Returns whether an
    /// entry existed. A caller walking away from a `Block`/`Async`/`Callback`
    /// send must do this to keep the table from leaking.
    pub fn abandon(&self, vector: u64) -> bool {
        self.table_lock().remove(vector)
    }

    /// Number of outstanding correlation entries.
    pub fn pending_count(&self) -> usize {
        self.table_lock().len()
    }

    /// Drains what the socket will take, shuts the stream down and marks the
    /// endpoint closed; every later operation is misuse. A dispatcher blocked
    /// in its readiness wait observes the shutdown and fails over to the
    /// connection-lost path.
    pub fn close(&self) -> NetworkResult<()> {
        self.guard()?;

        let mut conn = self.conn_lock();

        if self.drain_outbound(&mut conn).has_failed() {
            logging::debug!(self.log, "flush failed during close"; "context" => "close");
        }

        self.closed.store(true, Ordering::Release);
        logging::debug!(self.log, "endpoint closed";
                        "context" => "close",
                        "unsent" => conn.outbound.len());
        drop(conn.stream.shutdown(Shutdown::Both));
        drop(conn);
        self.signal();

        Ok(())
    }
}

impl Endpoint {
    fn service_inner(
        &self,
        await_vector: Option<u64>,
        block: bool,
        deadline: Option<Instant>,
    ) -> NetworkResult<Option<VectorMessage>> {
        loop {
            // Fast path: a reply deposited by another caller is handed over
            // without touching the socket, even after a connection loss.
            if let Some(vector) = await_vector {
                if let Some(message) = self.table_lock().take_ready(vector) {
                    return Ok(Some(message));
                }
            }

            self.guard()?;

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }

            match self.poller.try_lock() {
                Ok(mut poller) => {
                    // The reply may have been deposited between the fast-path
                    // check and acquiring the dispatcher role.
                    if let Some(vector) = await_vector {
                        if let Some(message) = self.table_lock().take_ready(vector) {
                            return Ok(Some(message));
                        }
                    }

                    let result = self.cycle(&mut poller, await_vector, block, deadline);

                    drop(poller);
                    // Hand the socket over to whichever waiter needs it next.
                    self.signal();

                    match result? {
                        Some(message) => {
                            if let Some(vector) = await_vector {
                                self.table_lock().remove(vector);
                            }
                            return Ok(Some(message));
                        }
                        None => {
                            if !block {
                                return Ok(None);
                            }
                        }
                    }
                }
                Err(TryLockError::WouldBlock) => {
                    // Another caller is mid-cycle; their cycle counts as the
                    // one a non-blocking probe is entitled to.
                    if !block {
                        return Ok(None);
                    }

                    self.park(await_vector, deadline);
                }
                Err(TryLockError::Poisoned(_)) => panic!("Dispatcher mutex poisoned"),
            }
        }
    }

    /// One readiness cycle: wait, ingest, drain, dispatch. Only the
    /// dispatcher mutex is held across the wait itself; the endpoint mutex
    /// is taken afterwards for the non-blocking socket work.
    fn cycle(
        &self,
        poller: &mut Poller,
        await_vector: Option<u64>,
        block: bool,
        deadline: Option<Instant>,
    ) -> NetworkResult<Option<VectorMessage>> {
        {
            let mut conn = self.conn_lock();

            // Frames fed through the pop surfaces may already be complete;
            // dispatch them before committing to a wait.
            if let Some(message) = self.dispatch_assembled(&mut conn, await_vector)? {
                return Ok(Some(message));
            }
        }

        let timeout = if block {
            deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
        } else {
            Some(ZERO_TIME)
        };

        poller
            .poll
            .poll(&mut poller.events, timeout)
            .map_err(|err| self.fail(err.into()))?;

        let mut readable = false;
        let mut writable = false;
        let mut excepted = false;

        for event in &poller.events {
            let readiness = event.readiness();
            let unix_readiness = mio::unix::UnixReady::from(readiness);

            readable |= readiness.is_readable() || unix_readiness.is_hup();
            writable |= readiness.is_writable();
            excepted |= unix_readiness.is_error();
        }

        if excepted {
            return Err(self.fail(NetworkError::Fatal(ErrorType::ConnectionLost)));
        }

        let mut conn = self.conn_lock();

        if readable {
            self.ingress(&mut conn)?;
        }

        if writable {
            self.drain_outbound(&mut conn)?;
        }

        self.dispatch_assembled(&mut conn, await_vector)
    }

    /// Reads until the socket would block, feeding the assembler. A
    /// zero-length read means the peer is gone.
    fn ingress(&self, conn: &mut Conn) -> NetworkResult<()> {
        let Conn {
            stream,
            assembler,
            scratch,
            ..
        } = conn;

        loop {
            match stream.read(&mut scratch[..]) {
                Ok(0) => {
                    if assembler.is_mid_frame() {
                        logging::debug!(self.log, "stream ended mid frame";
                                        "context" => "ingress",
                                        "buffered" => assembler.buffered());
                    }
                    return Err(self.fail(NetworkError::Fatal(ErrorType::ConnectionLost)));
                }
                Ok(count) => {
                    logging::trace!(self.log, "bytes received"; "context" => "ingress", "count" => count);
                    assembler.feed(&scratch[..count]);
                }
                Err(err) => {
                    return match NetworkError::from(err) {
                        NetworkError::Wait => Ok(()),
                        fatal => Err(self.fail(Self::classify_io(fatal))),
                    };
                }
            }
        }
    }

    /// Drains complete vector messages in arrival order and classifies each
    /// one. Callbacks are invoked with the table lock released.
    fn dispatch_assembled(
        &self,
        conn: &mut Conn,
        await_vector: Option<u64>,
    ) -> NetworkResult<Option<VectorMessage>> {
        let mut matched = None;

        while let Some(message) = self.pop_vector_locked(conn, None)? {
            let (vector, rvector) = (message.vector, message.rvector);

            if matched.is_none() && await_vector == Some(rvector) {
                logging::trace!(self.log, "awaited reply matched";
                                "context" => "dispatch",
                                "vector" => vector,
                                "rvector" => rvector);
                matched = Some(message);
                continue;
            }

            let delivery = {
                let mut table = self.table_lock();
                let delivery = table.deposit(message);

                if let Delivery::Stored = delivery {
                    self.ready.notify_all();
                }

                delivery
            };

            match delivery {
                Delivery::Stored => {
                    logging::trace!(self.log, "reply stored";
                                    "context" => "dispatch",
                                    "vector" => vector,
                                    "rvector" => rvector);
                }
                Delivery::Dispatch(callback, message) => {
                    logging::trace!(self.log, "reply dispatched";
                                    "context" => "dispatch",
                                    "vector" => vector,
                                    "rvector" => rvector);
                    callback(message);
                }
                Delivery::Discarded => {
                    logging::trace!(self.log, "message discarded";
                                    "context" => "dispatch",
                                    "vector" => vector,
                                    "rvector" => rvector);
                }
            }
        }

        Ok(matched)
    }

    /// Parks the caller until a reply is deposited or the park interval
    /// elapses. All rechecks happen at the top of the service loop.
    fn park(&self, await_vector: Option<u64>, deadline: Option<Instant>) {
        let table = self.table_lock();

        // Recheck under the table lock so a deposit between the fast-path
        // check and parking cannot be slept through.
        if let Some(vector) = await_vector {
            if table.is_ready(vector) {
                return;
            }
        }

        if self.lost.load(Ordering::Acquire) || self.closed.load(Ordering::Acquire) {
            return;
        }

        let timeout = match deadline {
            Some(deadline) => {
                let now = Instant::now();

                if now >= deadline {
                    return;
                }

                PARK_INTERVAL.min(deadline - now)
            }
            None => PARK_INTERVAL,
        };

        drop(
            self.ready
                .wait_timeout(table, timeout)
                .expect("Correlation table mutex poisoned"),
        );
    }

    /// Pops one assembled frame and splits the vector header off it.
    fn pop_vector_locked(
        &self,
        conn: &mut Conn,
        feed: Option<&[u8]>,
    ) -> NetworkResult<Option<VectorMessage>> {
        if let Some(feed) = feed {
            conn.assembler.feed(feed);
        }

        match conn.assembler.try_pop().map_err(|err| self.fail(err))? {
            Some(frame) => vector::split(frame).map(Some).map_err(|err| self.fail(err)),
            None => Ok(None),
        }
    }

    /// Non-blocking drain of the outbound queue; would-block folds to Ok.
    fn drain_outbound(&self, conn: &mut Conn) -> NetworkResult<()> {
        if conn.outbound.is_empty() {
            return Ok(());
        }

        let Conn {
            stream, outbound, ..
        } = conn;

        match outbound.egress(stream) {
            Ok(sent) => {
                logging::trace!(self.log, "outbound drained";
                                "context" => "drain",
                                "sent" => sent,
                                "queued" => outbound.len());
                Ok(())
            }
            Err(err) => match NetworkError::from(err) {
                NetworkError::Wait => Ok(()),
                fatal => Err(self.fail(Self::classify_io(fatal))),
            },
        }
    }

    /// Bumps the vector counter. Only called inside an endpoint-mutex
    /// region, which is what makes allocation and enqueue one critical
    /// section.
    fn alloc_vector(&self) -> u64 {
        let mut next = self.vector.lock().expect("Vector mutex poisoned");
        let vector = *next;

        *next += 1;

        vector
    }

    fn guard(&self) -> NetworkResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(NetworkError::Fatal(ErrorType::Closed));
        }

        if self.lost.load(Ordering::Acquire) {
            return Err(NetworkError::Fatal(ErrorType::ConnectionLost));
        }

        Ok(())
    }

    /// Records a fatal transport or protocol error and wakes every parked
    /// waiter so it can observe the loss.
    fn fail(&self, err: NetworkError) -> NetworkError {
        if let NetworkError::Fatal(kind) = &err {
            logging::debug!(self.log, "endpoint failure"; "context" => "fail", "error" => ?kind);
            self.lost.store(true, Ordering::Release);
            self.signal();
        }

        err
    }

    /// Errors that mean the stream itself is gone collapse into the single
    /// connection-lost condition.
    fn classify_io(err: NetworkError) -> NetworkError {
        match err {
            NetworkError::Fatal(ErrorType::Io(kind)) => match kind {
                io::ErrorKind::BrokenPipe
                | io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::UnexpectedEof => NetworkError::Fatal(ErrorType::ConnectionLost),
                _ => NetworkError::Fatal(ErrorType::Io(kind)),
            },
            other => other,
        }
    }

    fn signal(&self) {
        let _table = self.table_lock();

        self.ready.notify_all();
    }

    fn conn_lock(&self) -> MutexGuard<Conn> {
        self.conn.lock().expect("Endpoint mutex poisoned")
    }

    fn table_lock(&self) -> MutexGuard<Table> {
        self.table.lock().expect("Correlation table mutex poisoned")
    }
}
