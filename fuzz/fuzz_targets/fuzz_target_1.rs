#![no_main]

use libfuzzer_sys::fuzz_target;
use wsengine::assembler::MessageAssembler;
use wsengine::config::WebSocketConfig;
use wsengine::parser::FrameParser;

// Feeds arbitrary bytes straight into the frame parser/assembler pair as if they'd come
// off the wire. There's no well-formedness assumption on `data` at all: the only
// property under test is that malformed or truncated frames are rejected with an `Error`
// rather than panicking or looping forever.
fuzz_target!(|data: &[u8]| {
    let mut parser = FrameParser::new(true, Some(1 << 20));
    let mut assembler = MessageAssembler::new(WebSocketConfig::default(), None);

    let mut buf = data.to_vec();
    let _ = parser.consume(&mut buf, &mut assembler);
    let _ = assembler.take_outcomes();
});
