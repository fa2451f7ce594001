//! Deterministic condition and item assignment.
//!
//! Everything a participant is assigned is a pure function of their id:
//!
//! - the **condition** comes from an order-sensitive weighted sum of the
//!   id's character codes;
//! - the **items** come from a polynomial rolling hash of the same codes,
//!   finished with an avalanche step so the two seeds do not correlate.
//!
//! No external randomness is involved, so a participant who reloads the
//! page (or is re-assigned from a backup) lands in the same cell.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::condition::Condition;
use crate::stage::Stage;
use crate::types::{ItemId, ParticipantId};

/// Base of the rolling hash used for item selection.
const ITEM_HASH_BASE: u64 = 131;

/// Items a participant sees: one during the lesson, one in the final test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemAssignment {
    pub lesson: ItemId,
    pub final_test: ItemId,
}

/// Everything known about a participant's place in the experiment.
///
/// Only `current_stage` changes after assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantContext {
    pub participant_id: ParticipantId,
    pub condition: Condition,
    pub items: ItemAssignment,
    pub current_stage: Stage,
    pub created_at: DateTime<Utc>,
}

/// Order-sensitive weighted sum of character codes.
#[must_use]
pub fn condition_seed(id: &str) -> u64 {
    id.chars().enumerate().fold(0u64, |acc, (i, c)| {
        acc.wrapping_add((c as u64).wrapping_mul(i as u64 + 1))
    })
}

/// Polynomial rolling hash of character codes with a final avalanche.
#[must_use]
pub fn item_seed(id: &str) -> u64 {
    let rolling = id
        .chars()
        .fold(0u64, |acc, c| acc.wrapping_mul(ITEM_HASH_BASE).wrapping_add(c as u64));
    avalanche(rolling)
}

/// splitmix64 finalizer.
fn avalanche(mut z: u64) -> u64 {
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

/// Pick lesson and final-test items from a pool of `pool_size` items.
///
/// With two or more items the indices always differ: on a collision the
/// complement index is used, and if that is the same index (the middle of
/// an odd pool) the next index is used instead.
#[must_use]
pub fn select_items(seed: u64, pool_size: u32) -> ItemAssignment {
    let pool = u64::from(pool_size.max(1));
    let lesson = seed % pool;
    let mut final_test = (seed / pool) % pool;

    if pool >= 2 && final_test == lesson {
        final_test = pool - 1 - lesson;
        if final_test == lesson {
            final_test = (lesson + 1) % pool;
        }
    }

    ItemAssignment {
        lesson: ItemId(lesson as u32),
        final_test: ItemId(final_test as u32),
    }
}

/// Derive condition and items for a validated id.
#[must_use]
pub fn assign_id(participant_id: ParticipantId, pool_size: u32) -> ParticipantContext {
    let condition = Condition::from_seed(condition_seed(participant_id.as_str()));
    let items = select_items(item_seed(participant_id.as_str()), pool_size);

    info!(
        participant = %participant_id,
        condition = %condition,
        lesson_item = %items.lesson,
        final_item = %items.final_test,
        "participant assigned"
    );

    ParticipantContext {
        participant_id,
        condition,
        items,
        current_stage: Stage::INITIAL,
        created_at: Utc::now(),
    }
}

/// Assign a participant from a raw id.
///
/// A malformed id is never fatal: it is logged and replaced with a
/// generated development id.
#[must_use]
pub fn assign(raw_id: &str, pool_size: u32) -> ParticipantContext {
    let participant_id = match ParticipantId::parse(raw_id) {
        Ok(id) => id,
        Err(e) => {
            let generated = ParticipantId::generate();
            warn!(error = %e, fallback = %generated, "malformed participant id, using generated id");
            generated
        }
    };
    assign_id(participant_id, pool_size)
}

/// Discard the current context and start over at the initial stage.
///
/// Uses the supplied id when given, otherwise a fresh development id.
#[must_use]
pub fn reset(supplied_id: Option<&str>, pool_size: u32) -> ParticipantContext {
    match supplied_id {
        Some(raw) => assign(raw, pool_size),
        None => assign_id(ParticipantId::generate(), pool_size),
    }
}
