// Not all helpers are used by all tests.
#![allow(dead_code)]

use std::net::TcpStream;
use std::sync::Once;

use dsm::msg::Msg;

pub fn init() {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = env_logger::try_init();
    });
}

/// Reads the next frame and asserts its kind.
pub fn expect(conn: &mut TcpStream, name: &str) -> Msg {
    let msg = Msg::read_from(conn).expect("peer closed early");
    assert_eq!(msg.name(), name, "unexpected message");
    msg
}
