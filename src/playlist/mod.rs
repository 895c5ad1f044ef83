//! HLS codec-string helpers used by the HLS Planner when rendering playlists.

pub mod codec;
