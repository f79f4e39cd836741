//! Entity message handlers
//!
//! The application-level vocabulary spoken between peers: entity
//! announcements and attribute changes addressed by network id. Attribute
//! messages for entities that do not exist locally yet are parked in the
//! deferred-message cache and replayed until the entity appears or the
//! entry times out.
//!
//! On the host, every first receipt is mirrored verbatim to the other
//! connected clients; replays out of the cache are never mirrored again.

use std::rc::Rc;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use entity_sync::dispatch::{AttributeValue, HandlerContext, MessageDispatcher};
use entity_sync::wire::SharedMessage;

use crate::metrics::Metrics;

// ============================================================================
// Message Vocabulary
// ============================================================================

/// Category carrying all entity synchronization traffic
pub const CATEGORY_ENTITY: &str = "entity";

/// Announce that an entity with this network id now exists.
/// Payload: i32 network id.
pub const ENTITY_ANNOUNCE: i32 = 1;

/// Attach a map blip to an entity.
/// Payload: i32 network id, i32 sprite.
pub const ATTACH_BLIP: i32 = 2;

/// Set a named boolean flag on an entity.
/// Payload: i32 network id, string flag name, bool value.
pub const SET_FLAG: i32 = 3;

// ============================================================================
// Registration
// ============================================================================

/// Register the entity vocabulary on a dispatcher.
pub fn register_entity_handlers(dispatcher: &mut MessageDispatcher, metrics: Arc<Metrics>) {
    dispatcher.add_user_data_handler(CATEGORY_ENTITY, ENTITY_ANNOUNCE, {
        let metrics = Arc::clone(&metrics);
        Rc::new(move |ctx, msg| handle_announce(ctx, msg, &metrics))
    });

    dispatcher.add_user_data_handler(CATEGORY_ENTITY, ATTACH_BLIP, {
        let metrics = Arc::clone(&metrics);
        Rc::new(move |ctx, msg| {
            handle_attribute(ctx, msg, &metrics, |msg| {
                let sprite = msg.read_i32()?;
                Ok(("Blip".to_string(), AttributeValue::Int(sprite)))
            })
        })
    });

    dispatcher.add_user_data_handler(CATEGORY_ENTITY, SET_FLAG, {
        let metrics = Arc::clone(&metrics);
        Rc::new(move |ctx, msg| {
            handle_attribute(ctx, msg, &metrics, |msg| {
                let name = msg.read_string()?;
                let value = msg.read_bool()?;
                Ok((name, AttributeValue::Bool(value)))
            })
        })
    });
}

// ============================================================================
// Handlers
// ============================================================================

fn handle_announce(ctx: &mut HandlerContext<'_>, msg: &SharedMessage, metrics: &Metrics) {
    let network_id = match msg.read_i32() {
        Ok(id) => id,
        Err(e) => {
            log::debug!("malformed announce from {}: {}", msg.sender(), e);
            return;
        }
    };

    if ctx.cache.has_id_been_created_recently(network_id) {
        // Dedup the count and the mirror, but extend the expiry
        log::debug!("duplicate announce for entity {}", network_id);
        ctx.cache.add_recently_created_id(network_id);
        return;
    }

    log::debug!("entity {} announced by {}", network_id, msg.sender());
    metrics.announced_total.fetch_add(1, Ordering::Relaxed);
    ctx.cache.add_recently_created_id(network_id);
    ctx.send_to_all_except(msg);
}

/// Common shape of the attribute messages: an i32 network id followed by
/// a message-specific payload parsed by `parse`. Applies immediately when
/// the entity exists locally, defers otherwise.
fn handle_attribute<F>(
    ctx: &mut HandlerContext<'_>,
    msg: &SharedMessage,
    metrics: &Metrics,
    parse: F,
) where
    F: Fn(&SharedMessage) -> Result<(String, AttributeValue), entity_sync::wire::ReadError>,
{
    // Replays come back out of the cache; only first receipts mirror
    let is_replay = ctx.cache.is_in_queue(msg);

    let network_id = match msg.read_i32() {
        Ok(id) => id,
        Err(e) => {
            log::debug!(
                "malformed {}/{} from {}: {}",
                msg.category(),
                msg.code(),
                msg.sender(),
                e
            );
            return;
        }
    };

    if !is_replay {
        ctx.send_to_all_except(msg);
    }

    if ctx.world.has_local_representation(network_id) {
        let (attribute, value) = match parse(msg) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::debug!(
                    "malformed {}/{} payload for entity {}: {}",
                    msg.category(),
                    msg.code(),
                    network_id,
                    e
                );
                return;
            }
        };
        log::debug!("applying {} to entity {}", attribute, network_id);
        metrics.applied_total.fetch_add(1, Ordering::Relaxed);
        ctx.world.apply_attribute(network_id, &attribute, value);
    } else {
        if !is_replay {
            metrics.deferred_total.fetch_add(1, Ordering::Relaxed);
        }
        ctx.cache.add_message_default(msg);
    }
}

// ============================================================================
// Tests
// ============================================================================
