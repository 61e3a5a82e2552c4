use std::collections::{HashMap, VecDeque};

use crate::characteristic::{CharacteristicId, WriteType};
use crate::common::PeripheralId;
use crate::pending::Responder;
use crate::{Error, Result};

type LaneKey = (PeripheralId, CharacteristicId);

/// A caller's write as it reaches the session task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct WriteRequest {
    /// Identifies this caller's entry for [`WriteQueue::abandon`]
    pub(crate) ticket: u64,
    pub(crate) data: Vec<u8>,
    pub(crate) write_type: WriteType,
    /// Overrides the session-wide chunk size for this write
    pub(crate) chunk_size: Option<usize>,
}

/// One caller's write. A payload larger than the chunk size is split up
/// front and delivered chunk by chunk.
#[derive(Debug)]
pub(crate) struct WriteQueueEntry {
    chunks: VecDeque<Vec<u8>>,
    write_type: WriteType,
    responder: Option<Responder<()>>,
    ticket: u64,
    /// At least one chunk was handed to the radio.
    started: bool,
}

impl WriteQueueEntry {
    pub(crate) fn new(request: WriteRequest, default_chunk_size: Option<usize>, responder: Responder<()>) -> Self {
        Self {
            chunks: split(request.data, request.chunk_size.or(default_chunk_size)),
            write_type: request.write_type,
            responder: Some(responder),
            ticket: request.ticket,
            started: false,
        }
    }

    fn finish(self, result: Result<()>) {
        if let Some(responder) = self.responder {
            responder.send(result);
        }
    }
}

#[derive(Debug, Default)]
struct Lane {
    entries: VecDeque<WriteQueueEntry>,
    /// An acknowledged chunk of the head entry is with the radio.
    awaiting_ack: bool,
}

impl Lane {
    fn is_idle(&self) -> bool {
        self.entries.is_empty() && !self.awaiting_ack
    }
}

/// FIFO of writes per (peripheral, characteristic).
///
/// Entries of one lane reach the radio strictly in enqueue order. While an
/// acknowledged chunk is outstanding nothing else is issued on that lane;
/// unacknowledged chunks complete as soon as the radio accepts them.
#[derive(Debug, Default)]
pub(crate) struct WriteQueue {
    lanes: HashMap<LaneKey, Lane>,
}

fn split(payload: Vec<u8>, chunk_size: Option<usize>) -> VecDeque<Vec<u8>> {
    match chunk_size {
        Some(size) if size > 0 && payload.len() > size => {
            payload.chunks(size).map(<[u8]>::to_vec).collect()
        }
        _ => VecDeque::from(vec![payload]),
    }
}

impl WriteQueue {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Appends a write to its lane. Returns `true` if the lane was idle, in
    /// which case the caller should [`pump`](Self::pump) it.
    pub(crate) fn enqueue(
        &mut self,
        peripheral: PeripheralId,
        characteristic: CharacteristicId,
        entry: WriteQueueEntry,
    ) -> bool {
        let lane = self.lanes.entry((peripheral, characteristic)).or_default();
        let idle = lane.is_idle();
        lane.entries.push_back(entry);
        idle
    }

    /// Hands chunks to `issue` until the lane is empty or waiting for an
    /// acknowledgement.
    pub(crate) fn pump<F>(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        mut issue: F,
    ) where
        F: FnMut(&[u8], WriteType) -> Result<()>,
    {
        let key = (peripheral.clone(), *characteristic);

        loop {
            let Some(lane) = self.lanes.get_mut(&key) else {
                return;
            };
            if lane.awaiting_ack {
                return;
            }
            let Some(entry) = lane.entries.front_mut() else {
                self.lanes.remove(&key);
                return;
            };
            let Some(chunk) = entry.chunks.pop_front() else {
                if let Some(entry) = lane.entries.pop_front() {
                    entry.finish(Ok(()));
                }
                continue;
            };

            log::debug!(
                "Writing {} bytes to {} on {} (entry #{})",
                chunk.len(),
                characteristic,
                peripheral,
                entry.ticket
            );

            entry.started = true;
            match issue(&chunk, entry.write_type) {
                Err(e) => {
                    if let Some(entry) = lane.entries.pop_front() {
                        entry.finish(Err(Error::WriteError(e.to_string())));
                    }
                }
                Ok(()) if entry.write_type == WriteType::WithResponse => {
                    lane.awaiting_ack = true;
                    return;
                }
                Ok(()) => {
                    if entry.chunks.is_empty() {
                        if let Some(entry) = lane.entries.pop_front() {
                            entry.finish(Ok(()));
                        }
                    }
                }
            }
        }
    }

    /// Applies the radio's completion of the outstanding acknowledged chunk.
    /// Returns `false` for a callback nobody is waiting for. The lane must be
    /// pumped afterwards.
    pub(crate) fn on_write_completed(
        &mut self,
        peripheral: &PeripheralId,
        characteristic: &CharacteristicId,
        result: std::result::Result<(), String>,
    ) -> bool {
        let key = (peripheral.clone(), *characteristic);
        let Some(lane) = self.lanes.get_mut(&key) else {
            return false;
        };
        if !lane.awaiting_ack {
            return false;
        }
        lane.awaiting_ack = false;

        match result {
            Err(reason) => {
                if let Some(entry) = lane.entries.pop_front() {
                    entry.finish(Err(Error::WriteError(reason)));
                }
            }
            Ok(()) => {
                let done = lane
                    .entries
                    .front()
                    .map_or(false, |entry| entry.chunks.is_empty());
                if done {
                    if let Some(entry) = lane.entries.pop_front() {
                        entry.finish(Ok(()));
                    }
                }
            }
        }

        true
    }

    /// Gives up on one caller's write. A write the radio has not seen yet is
    /// dropped; one already under way finishes without its caller.
    pub(crate) fn abandon(&mut self, peripheral: &PeripheralId, characteristic: &CharacteristicId, ticket: u64) -> bool {
        let key = (peripheral.clone(), *characteristic);
        let Some(lane) = self.lanes.get_mut(&key) else {
            return false;
        };
        let Some(index) = lane.entries.iter().position(|entry| entry.ticket == ticket) else {
            return false;
        };

        if lane.entries[index].started {
            lane.entries[index].responder = None;
        } else {
            lane.entries.remove(index);
        }

        if lane.is_idle() {
            self.lanes.remove(&key);
        }
        true
    }

    /// [`abandon`](Self::abandon) for every write of one lane. Returns the
    /// number of callers let go.
    pub(crate) fn abandon_lane(&mut self, peripheral: &PeripheralId, characteristic: &CharacteristicId) -> usize {
        let key = (peripheral.clone(), *characteristic);
        let Some(lane) = self.lanes.get_mut(&key) else {
            return 0;
        };

        let queued = lane.entries.len();
        lane.entries.retain(|entry| entry.started);
        let mut abandoned = queued - lane.entries.len();
        abandoned += lane
            .entries
            .iter_mut()
            .filter_map(|entry| entry.responder.take())
            .count();

        if lane.is_idle() {
            self.lanes.remove(&key);
        }
        abandoned
    }

    /// Drops every queued write of a peripheral, rejecting their callers.
    pub(crate) fn reject_peripheral(&mut self, peripheral: &PeripheralId, error: Error) -> usize {
        let keys = self
            .lanes
            .keys()
            .filter(|(id, _)| id == peripheral)
            .cloned()
            .collect::<Vec<_>>();

        let mut flushed = 0;
        for key in keys {
            if let Some(lane) = self.lanes.remove(&key) {
                for entry in lane.entries {
                    entry.finish(Err(error.clone()));
                    flushed += 1;
                }
            }
        }
        flushed
    }

    pub(crate) fn reject_all(&mut self, error: Error) {
        for (_, lane) in self.lanes.drain() {
            for entry in lane.entries {
                entry.finish(Err(error.clone()));
            }
        }
    }

    /// Number of writes not yet completed.
    pub(crate) fn len(&self) -> usize {
        self.lanes.values().map(|lane| lane.entries.len()).sum()
    }

    pub(crate) fn lane_len(&self, peripheral: &PeripheralId, characteristic: &CharacteristicId) -> usize {
        self.lanes
            .get(&(peripheral.clone(), *characteristic))
            .map_or(0, |lane| lane.entries.len())
    }
}
