//! Feeds a raw 188-byte-packet TS file through [`isdb_core::pipeline::Pipeline`] and logs
//! decoded PAT/PMT/SDT/EIT activity as it streams by. Adapted from the teacher crate's own
//! `examples/dump.rs`, which drove a single-packet parser directly; this one drives the
//! full filter graph instead, since that is what a caller of this crate actually wants.

use isdb_core::config::RuntimeConfig;
use isdb_core::pipeline::Pipeline;
use std::env;
use std::fs::File;
use std::io::Read;

fn main() {
    pretty_env_logger::init();

    let file_path = env::args().nth(1).expect("usage: dump <ts-file>");
    let mut file = File::open(&file_path).expect("unable to open input file");

    let pipeline = Pipeline::new(RuntimeConfig::default());
    pipeline.analyzer().add_listener(|event| println!("{:?}", event));

    let mut buf = vec![0_u8; 188 * 1024];
    loop {
        let n = file.read(&mut buf).expect("IO error reading input file");
        if n == 0 {
            break;
        }
        pipeline.feed(&buf[..n]);
    }

    pipeline.shutdown();
}
