#![no_main]

use libfuzzer_sys::fuzz_target;
use carousel_cache::protocol::{Command, WorkerResult, decode_frame, encode_frame};

fuzz_target!(|data: &[u8]| {
    // Arbitrary bytes must never panic the decoder, only error or wait.
    if let Ok(Some((cmd, used))) = decode_frame::<Command>(data) {
        assert!(used <= data.len(), "consumed {used} of {} bytes", data.len());
        // Anything accepted must survive a re-encode unchanged.
        let again = encode_frame(&cmd).expect("decoded command should encode");
        let (back, _) = decode_frame::<Command>(&again)
            .expect("re-encoded frame should decode")
            .expect("re-encoded frame is complete");
        assert_eq!(back, cmd);
    }

    if let Ok(Some((_, used))) = decode_frame::<WorkerResult>(data) {
        assert!(used <= data.len(), "consumed {used} of {} bytes", data.len());
    }
});
