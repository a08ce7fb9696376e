//! Reliable Channel
//!
//! Ordered, ack-gated, garbage-collected delivery from A to B over a pair
//! of versioned maps. A writes messages into its own map; B acknowledges
//! the last processed index in its own map; A drops acknowledged messages.
//!
//! Writer map layout:
//!
//! ```text
//! __channels__ : { "<name>": { "contents": [msg, ...], "index": <first index in contents> } }
//! ```
//!
//! Reader map layout:
//!
//! ```text
//! __acks__ : { "<name>": <index of last processed message> }
//! ```
//!
//! Indices start at 0 and `contents[i]` has global index `index + i`.

use crate::error::{Result, SharingError};
use crate::map::MapRef;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

pub const CHANNELS_KEY: &str = "__channels__";
pub const ACKS_KEY: &str = "__acks__";

/// Index of the first message ever sent on a channel.
pub const FIRST_INDEX: u64 = 0;

/// Pending messages of one channel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChannelState {
    pub contents: Vec<Value>,
    pub index: u64,
}

/// Result of a `receive`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Messages {
    /// Global index of the first returned message.
    pub index: u64,
    pub messages: Vec<Value>,
}

type Channels = BTreeMap<String, ChannelState>;
type Acks = BTreeMap<String, u64>;

fn read_key<T>(reference: &MapRef, key: &str) -> Result<T>
where
    T: Default + serde::de::DeserializeOwned,
{
    match reference.get(key) {
        Some(value) => Ok(serde_json::from_value(value.clone())?),
        None => Ok(T::default()),
    }
}

fn write_key<T: Serialize>(writer: &mut MapRef, key: &str, value: &T) -> Result<()> {
    writer.set(key, serde_json::to_value(value)?)
}

/// Create the channel and ack tables if missing.
pub fn init(writer: &mut MapRef) -> Result<()> {
    if !writer.has(CHANNELS_KEY) {
        write_key(writer, CHANNELS_KEY, &Channels::new())?;
    }
    if !writer.has(ACKS_KEY) {
        write_key(writer, ACKS_KEY, &Acks::new())?;
    }
    Ok(())
}

/// Remove a channel and its ack cursor from the writer map.
pub fn delete_channel(writer: &mut MapRef, name: &str) -> Result<()> {
    init(writer)?;
    let mut channels: Channels = read_key(writer, CHANNELS_KEY)?;
    if channels.remove(name).is_some() {
        write_key(writer, CHANNELS_KEY, &channels)?;
    }
    let mut acks: Acks = read_key(writer, ACKS_KEY)?;
    if acks.remove(name).is_some() {
        write_key(writer, ACKS_KEY, &acks)?;
    }
    Ok(())
}

/// Global index of the first message still kept for `name`.
pub fn first_index(reference: &MapRef, name: &str) -> Result<u64> {
    let channels: Channels = read_key(reference, CHANNELS_KEY)?;
    Ok(channels.get(name).map_or(FIRST_INDEX, |c| c.index))
}

/// Last acknowledged index for `name`, `None` if nothing was acknowledged.
pub fn first_ack_index(reference: &MapRef, name: &str) -> Result<Option<u64>> {
    let acks: Acks = read_key(reference, ACKS_KEY)?;
    Ok(acks.get(name).copied())
}

pub fn channel_names(reference: &MapRef) -> Result<Vec<String>> {
    let channels: Channels = read_key(reference, CHANNELS_KEY)?;
    Ok(channels.into_keys().collect())
}

/// Append messages to a channel.
///
/// Returns the global index of the first appended message, or `None` when
/// `messages` is empty.
pub fn send(writer: &mut MapRef, name: &str, messages: Vec<Value>) -> Result<Option<u64>> {
    init(writer)?;
    if messages.is_empty() {
        return Ok(None);
    }
    let mut channels: Channels = read_key(writer, CHANNELS_KEY)?;
    let channel = channels.entry(name.to_string()).or_default();
    let first = channel.index + channel.contents.len() as u64;
    channel.contents.extend(messages);
    write_key(writer, CHANNELS_KEY, &channels)?;
    Ok(Some(first))
}

/// Drop every message acknowledged in `acks_ref`.
pub fn gc(writer: &mut MapRef, acks_ref: &MapRef) -> Result<()> {
    init(writer)?;
    let acks: Acks = read_key(acks_ref, ACKS_KEY)?;
    if acks.is_empty() {
        return Ok(());
    }

    let mut channels: Channels = read_key(writer, CHANNELS_KEY)?;
    let mut changed = false;
    for (name, ack) in &acks {
        let Some(channel) = channels.get_mut(name) else {
            continue;
        };
        if channel.contents.is_empty() || *ack < channel.index {
            continue;
        }
        let seen = ack - channel.index + 1;
        if seen > channel.contents.len() as u64 {
            return Err(SharingError::InvalidAck {
                channel: name.clone(),
                ack: *ack,
                index: channel.index,
                len: channel.contents.len(),
            });
        }
        channel.contents.drain(..seen as usize);
        channel.index += seen;
        changed = true;
    }

    if changed {
        write_key(writer, CHANNELS_KEY, &channels)?;
    }
    Ok(())
}

/// Read the unseen messages of `name` from `contents_ref` and advance the
/// ack cursor in `writer`.
///
/// A repeated call with no new messages returns an empty list.
pub fn receive(writer: &mut MapRef, contents_ref: &MapRef, name: &str) -> Result<Messages> {
    init(writer)?;
    let mut acks: Acks = read_key(writer, ACKS_KEY)?;
    let last_ack = acks.get(name).copied();
    let next = last_ack.map_or(FIRST_INDEX, |ack| ack + 1);

    let channels: Channels = read_key(contents_ref, CHANNELS_KEY)?;
    let Some(channel) = channels.get(name) else {
        return Ok(Messages {
            index: next,
            messages: Vec::new(),
        });
    };
    if channel.contents.is_empty() {
        return Ok(Messages {
            index: next,
            messages: Vec::new(),
        });
    }
    if next < channel.index {
        return Err(SharingError::InvalidAck {
            channel: name.to_string(),
            ack: next,
            index: channel.index,
            len: channel.contents.len(),
        });
    }

    let already_seen = (next - channel.index) as usize;
    if already_seen >= channel.contents.len() {
        return Ok(Messages {
            index: next,
            messages: Vec::new(),
        });
    }

    let messages = channel.contents[already_seen..].to_vec();
    acks.insert(
        name.to_string(),
        channel.index + channel.contents.len() as u64 - 1,
    );
    write_key(writer, ACKS_KEY, &acks)?;
    Ok(Messages {
        index: next,
        messages,
    })
}
