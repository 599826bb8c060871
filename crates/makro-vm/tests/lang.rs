use std::path::Path;
use std::{fs, str};

use makro_vm::{InterpretError, VM};
use pretty_assertions::assert_eq;
use test_generator::test_resources;

#[test_resources("crates/makro-vm/res/examples/**/*.makro")]
fn makro(path: &str) {
    let path = Path::new("../..").join(path);
    let source = fs::read_to_string(&path)
        .unwrap_or_else(|_| panic!("could not read test file: {}", path.display()));

    let mut exp_output = String::new();
    for line in source.lines() {
        const OUT_COMMENT: &str = "// out: ";
        if let Some(idx) = line.find(OUT_COMMENT) {
            exp_output += &line[idx + OUT_COMMENT.len()..];
            exp_output += "\n";
        }
    }

    let mut got_output = Vec::new();
    match VM::default().interpret(&source, &mut got_output) {
        Ok(()) => {}
        Err(InterpretError::Compile(errors)) => {
            let (e, _) = errors.first().expect("received empty error");
            got_output.extend(format!("{e}\n").into_bytes());
        }
        Err(InterpretError::Runtime { error: (e, _), .. }) => {
            got_output.extend(format!("{e}\n").into_bytes());
        }
    }
    let got_output = str::from_utf8(&got_output).expect("invalid UTF-8 in output");
    assert_eq!(exp_output, got_output);
}
