fn main() {
    for path in ["res/examples/**/*.makro", "res/benchmarks/**/*.makro"] {
        build_deps::rerun_if_changed_paths(path).expect("could not read path");
    }
}
