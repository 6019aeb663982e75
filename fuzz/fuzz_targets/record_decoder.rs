#![no_main]

use libfuzzer_sys::fuzz_target;
use megatrace::encoder::{decode, decode_record, encode};

fuzz_target!(|data: &[u8]| {
    // Anything that decodes must re-encode into a record that decodes to
    // the same kind and timestamp
    if let Ok((event, used)) = decode(data) {
        assert!(used <= data.len());
        let again = decode_record(&encode(&event)).unwrap();
        assert_eq!(again.kind(), event.kind());
        assert_eq!(again.timestamp_ns(), event.timestamp_ns());
    }
});
