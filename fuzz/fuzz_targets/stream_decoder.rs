#![no_main]

use libfuzzer_sys::fuzz_target;
use megatrace::capture::Capture;
use megatrace::wire::StreamDecoder;

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must decode to frames or an error, never a panic,
    // and whatever decodes must render
    let mut capture = Capture::new();
    let mut events = Vec::new();
    for message in StreamDecoder::new(data) {
        match message {
            Ok(message) => capture.apply(message, &mut events),
            Err(_) => break,
        }
    }
    for event in &events {
        let _ = capture.render_text(event);
        let _ = capture.render_json(event);
    }
});
