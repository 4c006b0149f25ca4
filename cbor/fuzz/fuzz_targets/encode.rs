#![no_main]

use keel_cbor::encode::Encoder;
use libfuzzer_sys::fuzz_target;

// Drive an arbitrary operation sequence against a buffer that is usually
// too small. Whatever the sequence, the encoder must not panic, must not
// write past the storage, and must report any failure through finish().
fuzz_target!(|data: &[u8]| {
    let mut storage = [0u8; 64];
    let mut encoder = Encoder::new(&mut storage);

    let mut bytes = data.iter().copied();
    while let Some(op) = bytes.next() {
        let arg = bytes.next().unwrap_or(0);
        match op % 16 {
            0 => encoder.emit_uint(arg as u64 * 257),
            1 => encoder.emit_int(arg as i64 - 128),
            2 => encoder.emit_bytes(&data[..(arg as usize).min(data.len())]),
            3 => encoder.emit_text("fuzz"),
            4 => encoder.emit_encoded(&[0x01]),
            5 => encoder.emit_tag(arg as u64),
            6 => encoder.emit_double(f64::from_bits((arg as u64) << 56 | arg as u64)),
            7 => encoder.emit_simple(arg),
            8 => encoder.emit_bool(arg & 1 == 0),
            9 => encoder.open_array(),
            10 => encoder.open_map(),
            11 => encoder.open_bytes(),
            12 => encoder.close_array(),
            13 => encoder.close_map(),
            14 => {
                if let Some(wrap) = encoder.close_bytes() {
                    let _ = encoder.wrapped(&wrap);
                }
            }
            _ => encoder.emit_date_epoch(arg as i64),
        }
    }

    let _ = encoder.finish();
});
