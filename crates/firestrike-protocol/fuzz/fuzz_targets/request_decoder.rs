#![no_main]

use libfuzzer_sys::fuzz_target;
use firestrike_protocol::{Request, Response};

fuzz_target!(|data: &[u8]| {
    // Decoding arbitrary bytes must fail cleanly, never panic
    if let Ok(request) = Request::decode(data) {
        let encoded = request.encode().expect("valid request re-encodes");
        let _ = Request::decode(&encoded);
    }

    if let Ok(response) = Response::decode(data) {
        let _ = response.encode();
    }
});
