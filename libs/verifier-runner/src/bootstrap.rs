// Least-privilege launcher shipped next to every program the runners execute

use std::path::Path;

pub const BOOTSTRAP_SOURCE: &str = include_str!("bootstrap.py");
pub const BOOTSTRAP_FILE: &str = "bootstrap.py";
pub const PROGRAM_FILE: &str = "solution.py";

/// Interpreter flags: isolated mode (no env vars, no user site, no cwd on
/// sys.path) and no bytecode files.
pub const PYTHON_FLAGS: &[&str] = &["-I", "-B"];

/// Arguments after the interpreter path: flags, launcher, program, root.
pub fn launcher_args(bootstrap: &Path, program: &Path, root: &Path) -> Vec<String> {
    let mut args: Vec<String> = PYTHON_FLAGS.iter().map(|s| s.to_string()).collect();
    args.push(bootstrap.display().to_string());
    args.push(program.display().to_string());
    args.push(root.display().to_string());
    args
}
