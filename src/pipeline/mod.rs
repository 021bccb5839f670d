// The scrobble pipeline core: the play model, the fuzzy comparator, the
// transform engine, the lifecycle scaffold, and the event bus.

pub mod bus;
pub mod compare;
pub mod lifecycle;
pub mod normalize;
pub mod play;
pub mod transform;
