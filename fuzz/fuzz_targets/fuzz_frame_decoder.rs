#![no_main]

use bytes::BytesMut;
use libfuzzer_sys::fuzz_target;
use tokio_util::codec::Decoder;
use toolhost::transport::ContentLengthCodec;

fuzz_target!(|data: &[u8]| {
    // Small limits so the discard and skip paths are reached quickly.
    let mut codec = ContentLengthCodec::new(4096, 256);

    // Feed in two chunks to exercise partial-frame handling.
    let split = data.first().map_or(0, |b| usize::from(*b)).min(data.len());
    let mut buf = BytesMut::from(&data[..split]);
    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        assert!(frame.len() <= codec.max_message_size());
    }
    buf.extend_from_slice(&data[split..]);
    while let Ok(Some(frame)) = codec.decode(&mut buf) {
        assert!(frame.len() <= codec.max_message_size());
    }
    let _ = codec.decode_eof(&mut buf);
});
