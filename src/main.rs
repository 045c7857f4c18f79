use flock::prelude::*;

fn main() {
    // Request plans come from --url or --script, see --help.
    if let Err(e) = LoadTest::initialize().and_then(|load_test| load_test.execute()) {
        eprintln!("{}", e);
        std::process::exit(1);
    }
}
