use std::fs;
use std::io;

use criterion::{criterion_group, criterion_main, Criterion};
use makro_vm::VM;

pub fn lang(c: &mut Criterion) {
    let mut paths = fs::read_dir("res/benchmarks")
        .expect("could not read benchmark directory")
        .map(|entry| entry.expect("could not read benchmark entry").path())
        .collect::<Vec<_>>();
    paths.sort();

    for path in paths {
        let source = fs::read_to_string(&path)
            .unwrap_or_else(|_| panic!("could not read benchmark file: {}", path.display()));
        let name = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or("unknown");
        c.bench_function(name, |b| {
            b.iter(|| {
                VM::default().interpret(&source, &mut io::sink()).expect("benchmark failed")
            })
        });
    }
}

criterion_group!(benches, lang);
criterion_main!(benches);
