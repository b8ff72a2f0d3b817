#![no_main]

use libfuzzer_sys::fuzz_target;

use carapace_node::protocol::codec::{decode_line, encode_frame, FrameDecoder, MAX_LINE_BYTES};

fuzz_target!(|data: &[u8]| {
    // Arbitrary chunking must never panic, and the buffer stays bounded.
    let split = data.first().map(|b| *b as usize).unwrap_or(0) % (data.len() + 1);
    let mut decoder = FrameDecoder::new();
    let mut frames = decoder.push(&data[..split]);
    frames.extend(decoder.push(&data[split..]));
    assert!(decoder.buffered() <= MAX_LINE_BYTES);

    if let Ok(text) = std::str::from_utf8(data) {
        let _ = decode_line(text);
    }

    for frame in frames {
        let encoded = encode_frame(&frame).expect("decoded frame re-encodes");
        assert_eq!(encoded.last(), Some(&b'\n'));
    }
});
