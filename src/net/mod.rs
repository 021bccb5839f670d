// Outbound HTTP plumbing for the upstream services.

pub mod lastfm;
pub mod listenbrainz;
