use conduit::frame::{self, Assembler};
use conduit::vector;
use criterion::{criterion_group, criterion_main, Criterion};

fn bench_encode(c: &mut Criterion) {
    let payload = vec![7u8; 1024];

    c.bench_function("frame_encode_1k", |b| b.iter(|| frame::encode(&payload)));
    c.bench_function("vector_encode_1k", |b| {
        b.iter(|| vector::encode_message(1, 2, &payload))
    });
}

fn bench_assemble(c: &mut Criterion) {
    let wire = vector::encode_message(1, 0, &vec![7u8; 1024]);

    c.bench_function("assemble_1k", |b| {
        b.iter(|| {
            let mut assembler = Assembler::new(1 << 20);

            assembler.feed(&wire);
            vector::split(assembler.try_pop().unwrap().unwrap()).unwrap()
        })
    });
}

criterion_group!(benches, bench_encode, bench_assemble);
criterion_main!(benches);
