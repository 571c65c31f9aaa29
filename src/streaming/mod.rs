//! Level streaming: residency decisions, incremental association,
//! deferred unloads

pub mod add_to_world;
pub mod cross_refs;
pub mod frame_budget;
pub mod gc;
pub mod streamer;
pub mod streaming_ref;

pub use add_to_world::{add_to_world, add_to_world_with_budget, remove_from_world};
pub use cross_refs::{fixup_cross_level_refs, MAX_GUID_HASH_SIZE};
pub use frame_budget::{LoadThrottler, SliceBudget, ADD_TO_WORLD_BUDGET};
pub use gc::{collect_garbage, LevelPurgeSet};
pub use streamer::{allow_level_load_requests, flush_level_streaming, update_level_streaming};
pub use streaming_ref::{StreamingPolicy, StreamingRef, StreamingVolume};
