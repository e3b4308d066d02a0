#![no_main]

use libfuzzer_sys::fuzz_target;
use toolhost::protocol::{JsonRpcSerializer, MessageSerializer, VersionPolicy};

fuzz_target!(|data: &[u8]| {
    let serializer = JsonRpcSerializer::new(VersionPolicy::Lenient);
    // Anything that decodes must encode and decode back to the same shape.
    if let Ok(message) = serializer.decode(data) {
        let encoded = serializer.encode(&message).expect("decoded message must encode");
        let again = serializer.decode(&encoded).expect("encoded message must decode");
        assert_eq!(message.kind(), again.kind());
        assert_eq!(message.id(), again.id());
        assert_eq!(message.method(), again.method());
    }
});
