//! CPU-bound pattern detectors over listening history.
//!
//! Detectors are pure functions of the stream log; the pool runs them on
//! workers and emits `pattern:detected` per result plus a final
//! `pattern:all_complete`.

use std::collections::BTreeMap;

use serde_json::{json, Value};

use crate::core::Stream;

pub type Detector = fn(&[Stream]) -> Value;

/// All registered detectors, in emission order.
pub fn registry() -> Vec<(&'static str, Detector)> {
    vec![
        ("top_artist", top_artist),
        ("heavy_rotation", heavy_rotation),
        ("listening_totals", listening_totals),
    ]
}

/// Artist with the most accumulated play time.
fn top_artist(streams: &[Stream]) -> Value {
    let mut totals: BTreeMap<&str, u64> = BTreeMap::new();
    for stream in streams {
        *totals.entry(stream.artist.as_str()).or_default() += stream.ms_played;
    }
    match totals.iter().max_by_key(|(_, ms)| **ms) {
        Some((artist, ms)) => json!({ "artist": artist, "ms_played": ms }),
        None => Value::Null,
    }
}

/// Track with the most plays.
fn heavy_rotation(streams: &[Stream]) -> Value {
    let mut counts: BTreeMap<(&str, &str), u64> = BTreeMap::new();
    for stream in streams {
        *counts
            .entry((stream.artist.as_str(), stream.track.as_str()))
            .or_default() += 1;
    }
    match counts.iter().max_by_key(|(_, n)| **n) {
        Some(((artist, track), plays)) => {
            json!({ "artist": artist, "track": track, "plays": plays })
        }
        None => Value::Null,
    }
}

/// Aggregate totals for the whole log.
fn listening_totals(streams: &[Stream]) -> Value {
    let total_ms: u64 = streams.iter().map(|s| s.ms_played).sum();
    let distinct_artists = streams
        .iter()
        .map(|s| s.artist.as_str())
        .collect::<std::collections::BTreeSet<_>>()
        .len();
    json!({
        "streams": streams.len(),
        "total_ms": total_ms,
        "distinct_artists": distinct_artists,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(artist: &str, track: &str, ms: u64) -> Stream {
        Stream {
            ts: "2024-01-01".to_string(),
            track: track.to_string(),
            artist: artist.to_string(),
            ms_played: ms,
            context: None,
        }
    }

    #[test]
    fn top_artist_by_play_time() {
        let streams = vec![
            stream("A", "t1", 1_000),
            stream("B", "t2", 5_000),
            stream("A", "t3", 3_000),
        ];
        let result = top_artist(&streams);
        assert_eq!(result["artist"], "B");

        // Ties resolve deterministically (BTreeMap order).
        let tied = vec![stream("Z", "t", 100), stream("A", "t", 100)];
        assert_eq!(top_artist(&tied)["artist"], "A");
    }

    #[test]
    fn heavy_rotation_counts_plays() {
        let streams = vec![
            stream("A", "hit", 100),
            stream("A", "hit", 100),
            stream("B", "other", 9_999),
        ];
        let result = heavy_rotation(&streams);
        assert_eq!(result["track"], "hit");
        assert_eq!(result["plays"], 2);
    }

    #[test]
    fn totals_cover_the_log() {
        let streams = vec![stream("A", "t", 100), stream("B", "t", 200)];
        let result = listening_totals(&streams);
        assert_eq!(result["streams"], 2);
        assert_eq!(result["total_ms"], 300);
        assert_eq!(result["distinct_artists"], 2);
    }

    #[test]
    fn empty_log_is_null_not_panic() {
        assert_eq!(top_artist(&[]), Value::Null);
        assert_eq!(heavy_rotation(&[]), Value::Null);
    }
}
