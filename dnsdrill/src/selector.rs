//! Picks a sendable TCP/TLS socket for the sender, driving handshakes and
//! retrying staged writes along the way. UDP sockets never need this —
//! they're always `Ready` once opened — so the sender only calls here for
//! `Transport::Tcp`/`Transport::Tls`.

use tracing::warn;

use crate::socket_slot::{HandshakeProgress, SendState, SocketSlot};

/// Sweeps at most `sockets.len()` entries starting at `*cursor`, advancing
/// `*cursor` past whatever it examined. Returns the index of a socket that
/// is `Ready` to send on, or `None` if the whole sweep found nothing.
pub fn select_tcp_socket(sockets: &mut [SocketSlot], cursor: &mut usize, now: u64) -> Option<usize> {
    let n = sockets.len();
    if n == 0 {
        return None;
    }

    for step in 0..n {
        let idx = (*cursor + step) % n;
        if try_make_ready(&mut sockets[idx], now) {
            *cursor = (idx + 1) % n;
            return Some(idx);
        }
    }

    *cursor = (*cursor + n) % n;
    None
}

/// Drives one socket through as many of its own state transitions as are
/// immediately available (handshake step, staged retry) and reports
/// whether it ended up `Ready`. Bounded to a handful of iterations: at
/// most TcpHandshake → TlsHandshake → Ready, or a single `Sending` retry.
fn try_make_ready(slot: &mut SocketSlot, now: u64) -> bool {
    for _ in 0..4 {
        match slot.send_state {
            SendState::Closed | SendState::TcpSentMax => return false,
            SendState::Ready => return true,
            SendState::Sending => {
                return match slot.retry_staged() {
                    Ok(()) => true,
                    Err(e) => {
                        if !matches!(e, crate::socket_slot::SocketIoError::WouldBlock) {
                            warn!(shard = slot.shard_id, socket = slot.index, error = %e, "staged write failed");
                        }
                        false
                    }
                };
            }
            SendState::TcpHandshake => match slot.advance_handshake(now) {
                Ok(_) => continue,
                Err(e) => {
                    if !matches!(e, crate::socket_slot::SocketIoError::WouldBlock) {
                        warn!(shard = slot.shard_id, socket = slot.index, error = %e, "TCP handshake failed");
                    }
                    return false;
                }
            },
            SendState::TlsHandshake => match slot.advance_handshake(now) {
                Ok(HandshakeProgress::Done) => continue,
                Ok(HandshakeProgress::Pending) => return false,
                Err(e) => {
                    if !matches!(e, crate::socket_slot::SocketIoError::WouldBlock) {
                        warn!(shard = slot.shard_id, socket = slot.index, error = %e, "TLS handshake failed");
                    }
                    return false;
                }
            },
        }
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Transport;

    fn udp_slot(index: u16) -> SocketSlot {
        SocketSlot::new(
            0,
            index,
            index,
            Transport::Udp,
            "127.0.0.1:53".parse().unwrap(),
            "0.0.0.0:0".parse().unwrap(),
            None,
            None,
            None,
        )
    }

    #[test]
    fn skips_closed_sockets_and_returns_none_when_all_closed() {
        let mut sockets = vec![udp_slot(0), udp_slot(1)];
        let mut cursor = 0;
        assert_eq!(select_tcp_socket(&mut sockets, &mut cursor, 0), None);
    }

    #[test]
    fn finds_a_ready_socket_and_advances_cursor() {
        let mut sockets = vec![udp_slot(0), udp_slot(1)];
        sockets[1].send_state = SendState::Ready;

        let mut cursor = 0;
        let found = select_tcp_socket(&mut sockets, &mut cursor, 0);

        assert_eq!(found, Some(1));
        assert_eq!(cursor, 0); // wraps past the end back to 0
    }

    #[test]
    fn tcp_sent_max_socket_is_never_selected() {
        let mut sockets = vec![udp_slot(0)];
        sockets[0].send_state = SendState::TcpSentMax;

        let mut cursor = 0;
        assert_eq!(select_tcp_socket(&mut sockets, &mut cursor, 0), None);
    }
}
