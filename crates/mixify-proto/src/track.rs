//! Raw track name parsing.
//!
//! DJ software reports file names, which by convention read
//! `"Artist - Title"`.  Anything after the first separator is the title, so
//! `"A - B - C"` gives artist `A` and title `B - C`.

use crate::protocol::TrackInfo;

pub const SEPARATOR: &str = " - ";
pub const UNKNOWN_ARTIST: &str = "Unknown";

pub fn split_artist_title(raw: &str) -> TrackInfo {
    match raw.split_once(SEPARATOR) {
        Some((artist, rest)) => TrackInfo {
            artist: artist.trim().to_string(),
            title: rest.trim().to_string(),
        },
        None => TrackInfo {
            artist: UNKNOWN_ARTIST.to_string(),
            title: raw.to_string(),
        },
    }
}
