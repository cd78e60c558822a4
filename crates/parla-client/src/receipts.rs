//! Delivery and read ticks for own messages.

use std::collections::HashMap;

use parla_shared::protocol::ReceiptPayload;
use parla_shared::{MessageId, ReceiptState, UserId};
use parla_store::TickState;
use tracing::trace;

use crate::thread::ThreadView;

/// Tick for a message sent by `sender` given every observer's receipt.
///
/// The sender's own receipt is ignored. `None` means no other observer has
/// reported anything, so the current tick should stay as it is.
pub fn aggregate(sender: &UserId, receipts: &[ReceiptPayload]) -> Option<TickState> {
    let mut observers = receipts.iter().filter(|r| &r.user_id != sender).peekable();
    observers.peek()?;

    let mut delivered = false;
    for receipt in observers {
        match receipt.state {
            ReceiptState::Read => return Some(TickState::Read),
            ReceiptState::Delivered | ReceiptState::Sent => delivered = true,
            ReceiptState::Pending => {}
        }
    }
    Some(if delivered {
        TickState::Delivered
    } else {
        TickState::Sent
    })
}

/// Apply a receipt snapshot to the registered ticks of the open thread.
/// Returns how many ticks were upgraded.
pub fn reconcile(
    thread: &mut ThreadView,
    local_user: &UserId,
    snapshot: &HashMap<MessageId, Vec<ReceiptPayload>>,
) -> usize {
    let mut upgraded = 0;
    for id in thread.registered_ticks() {
        let Some(receipts) = snapshot.get(&id) else {
            continue;
        };
        if let Some(tick) = aggregate(local_user, receipts) {
            if thread.set_tick(&id, tick) {
                trace!(message = %id.short(), ?tick, "Tick upgraded");
                upgraded += 1;
            }
        }
    }
    upgraded
}
