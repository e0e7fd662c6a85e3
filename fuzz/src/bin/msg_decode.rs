#[macro_use]
extern crate afl;
use vigil::RatchetMessage;

fn main() {
    fuzz!(|data: &[u8]| {
        let _ = RatchetMessage::from_bytes(data);
    });
}
