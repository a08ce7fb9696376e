//! Reliable Channel Integration Tests
//!
//! Drives send / receive / gc in many interleavings across two maps and
//! checks exactly-once, in-order delivery.

use serde_json::{json, Value};
use shared_maps::channel::{self, Messages};
use shared_maps::{MapRef, VersionedMap};

/// Small deterministic generator so runs are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        self.0 >> 33
    }
}

fn commit(map: &VersionedMap, mut writer: MapRef) {
    if writer.has_changed() {
        writer.prepare().unwrap();
        map.commit(&writer).unwrap();
    }
}

fn run_interleaving(seed: u64) {
    let sender = VersionedMap::new();
    let receiver = VersionedMap::new();
    let mut rng = Lcg(seed);
    let mut sent = 0u64;
    let mut delivered: Vec<Value> = Vec::new();

    for _ in 0..200 {
        match rng.next() % 3 {
            0 => {
                let batch = (rng.next() % 4) as usize;
                let messages: Vec<Value> = (0..batch).map(|i| json!(sent + i as u64)).collect();
                let mut w = sender.writer();
                let first = channel::send(&mut w, "foo", messages).unwrap();
                if batch > 0 {
                    assert_eq!(first, Some(sent));
                }
                sent += batch as u64;
                commit(&sender, w);
            }
            1 => {
                let mut w = receiver.writer();
                let Messages { index, messages } =
                    channel::receive(&mut w, &sender.reader(), "foo").unwrap();
                if !messages.is_empty() {
                    assert_eq!(index, delivered.len() as u64);
                }
                delivered.extend(messages);
                commit(&receiver, w);
            }
            _ => {
                let mut w = sender.writer();
                channel::gc(&mut w, &receiver.reader()).unwrap();
                commit(&sender, w);
            }
        }
    }

    // drain
    let mut w = receiver.writer();
    delivered.extend(channel::receive(&mut w, &sender.reader(), "foo").unwrap().messages);
    commit(&receiver, w);
    let mut w = sender.writer();
    channel::gc(&mut w, &receiver.reader()).unwrap();
    commit(&sender, w);

    let expected: Vec<Value> = (0..sent).map(|i| json!(i)).collect();
    assert_eq!(delivered, expected, "seed {}", seed);

    let reader = sender.reader();
    assert_eq!(channel::first_index(&reader, "foo").unwrap(), sent);
    let state = reader.get(channel::CHANNELS_KEY).cloned().unwrap_or(json!({}));
    if let Some(chan) = state.get("foo") {
        assert_eq!(chan["contents"], json!([]));
    }
}

#[test]
fn test_exactly_once_in_order_for_many_interleavings() {
    for seed in 1..=25 {
        run_interleaving(seed);
    }
}

#[test]
fn test_two_channels_are_independent() {
    let sender = VersionedMap::new();
    let receiver = VersionedMap::new();

    let mut w = sender.writer();
    channel::send(&mut w, "a", vec![json!("a0"), json!("a1")]).unwrap();
    channel::send(&mut w, "b", vec![json!("b0")]).unwrap();
    commit(&sender, w);

    let mut w = receiver.writer();
    let got = channel::receive(&mut w, &sender.reader(), "b").unwrap();
    assert_eq!(got.messages, vec![json!("b0")]);
    commit(&receiver, w);

    let mut w = sender.writer();
    channel::gc(&mut w, &receiver.reader()).unwrap();
    assert_eq!(channel::first_index(&w, "a").unwrap(), 0);
    assert_eq!(channel::first_index(&w, "b").unwrap(), 1);
    assert_eq!(
        channel::channel_names(&w).unwrap(),
        vec!["a".to_string(), "b".to_string()]
    );
}
