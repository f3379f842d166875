//! Criterion benchmarks for revgrad live under `benches/`.
