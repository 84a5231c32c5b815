use crate::{
    error::{DataError, PipelineError},
    model::RawTick,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{
    cmp::Reverse,
    collections::{BinaryHeap, VecDeque},
    path::Path,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Ordered stream of [`RawTick`]s, identical in shape whatever its origin.
///
/// `Ok(None)` marks the end of the stream. A `DataError` affects only the tick it was raised for;
/// the caller logs it and keeps reading.
#[async_trait]
pub trait TickSource: Send {
    async fn next_tick(&mut self) -> Result<Option<RawTick>, DataError>;
}

/// Realtime source fed through a bounded channel by an external feed client.
#[derive(Debug)]
pub struct LiveTickSource {
    rx: mpsc::Receiver<RawTick>,
}

impl LiveTickSource {
    /// Construct a source and the sender a feed client pushes ticks into.
    pub fn channel(capacity: usize) -> Result<(mpsc::Sender<RawTick>, Self), PipelineError> {
        if capacity == 0 {
            return Err(PipelineError::ChannelConstruction {
                stage: "live feed",
                reason: "capacity must be > 0".to_string(),
            });
        }
        let (tx, rx) = mpsc::channel(capacity);
        Ok((tx, Self { rx }))
    }
}

#[async_trait]
impl TickSource for LiveTickSource {
    async fn next_tick(&mut self) -> Result<Option<RawTick>, DataError> {
        Ok(self.rx.recv().await)
    }
}

/// Historical replay source.
#[derive(Debug, Default)]
pub struct ReplayTickSource {
    ticks: VecDeque<RawTick>,
}

impl ReplayTickSource {
    /// Replay `ticks` in the order given.
    pub fn from_ticks(ticks: impl IntoIterator<Item = RawTick>) -> Self {
        Self {
            ticks: ticks.into_iter().collect(),
        }
    }

    /// Load JSON-lines tick files (one per instrument, or already merged) and merge them into
    /// one chronological stream. Equal timestamps keep file order, then line order.
    ///
    /// Undecodable lines are logged and skipped.
    pub async fn from_json_lines<P: AsRef<Path>>(
        paths: impl IntoIterator<Item = P>,
    ) -> Result<Self, PipelineError> {
        let mut files = Vec::new();
        for path in paths {
            let path = path.as_ref();
            let contents = tokio::fs::read_to_string(path).await.map_err(|error| {
                PipelineError::SourceFailed(format!("{}: {error}", path.display()))
            })?;

            let ticks = decode_json_lines(&contents, &path.display().to_string());
            info!(path = %path.display(), ticks = ticks.len(), "loaded replay file");
            files.push(ticks);
        }

        Ok(Self::from_ticks(merge_chronological(files)))
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn ticks(&self) -> impl Iterator<Item = &RawTick> {
        self.ticks.iter()
    }
}

#[async_trait]
impl TickSource for ReplayTickSource {
    async fn next_tick(&mut self) -> Result<Option<RawTick>, DataError> {
        Ok(self.ticks.pop_front())
    }
}

fn decode_json_lines(contents: &str, origin: &str) -> VecDeque<RawTick> {
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .filter_map(|(index, line)| match serde_json::from_str::<RawTick>(line) {
            Ok(tick) => Some(tick),
            Err(error) => {
                warn!(
                    %origin,
                    line = index + 1,
                    error = %DataError::Decode(error.to_string()),
                    "skipping undecodable tick"
                );
                None
            }
        })
        .collect()
}

/// K-way merge of individually ordered tick streams with a min-heap keyed on
/// (time, stream index).
fn merge_chronological(mut streams: Vec<VecDeque<RawTick>>) -> Vec<RawTick> {
    let mut heap = BinaryHeap::<Reverse<(DateTime<Utc>, usize)>>::with_capacity(streams.len());
    for (index, stream) in streams.iter().enumerate() {
        if let Some(tick) = stream.front() {
            heap.push(Reverse((tick.time, index)));
        }
    }

    let mut merged = Vec::with_capacity(streams.iter().map(VecDeque::len).sum());
    while let Some(Reverse((_, index))) = heap.pop() {
        let Some(tick) = streams[index].pop_front() else {
            continue;
        };
        merged.push(tick);
        if let Some(next) = streams[index].front() {
            heap.push(Reverse((next.time, index)));
        }
    }
    merged
}
