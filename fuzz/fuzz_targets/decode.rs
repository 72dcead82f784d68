#![no_main]

use libfuzzer_sys::fuzz_target;
use vesper_core::{compound, header::Header};
use vesper_transport::Framer;

fuzz_target!(|data: &[u8]| {
    // Decode paths must never panic on arbitrary input.
    let _ = Header::parse(data);
    let _ = compound::decompound(data, 16);

    let mut framer = Framer::new(1 << 16);
    framer.feed(data);
    while let Ok(Some(_)) = framer.next_record() {}
});
