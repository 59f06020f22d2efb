use criterion::criterion_main;


criterion_main!(write::benches, get::benches, iterate::benches);
