//! Per-server console fan-out.
//!
//! Each server id owns a channel: a bounded ring of recent [`OutputLine`]s for
//! late subscribers plus a `tokio::sync::broadcast` sender for live ones.
//! Publishing never waits on subscribers; a subscriber that falls behind its
//! queue loses the oldest lines and is told how many.

use std::{
    collections::{HashMap, VecDeque},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use futures_util::Stream;
use kiln_process::{OutputChannel, OutputLine, ServerId, now_unix_ms};
use tokio::sync::broadcast;

use crate::config::ConsoleLogConfig;
use crate::console_log::{self, ConsoleWriter};

#[derive(Debug)]
struct OutputRing {
    next_seq: u64,
    max_lines: usize,
    evicted: u64,
    lines: VecDeque<OutputLine>,
}

impl OutputRing {
    fn new(max_lines: usize) -> Self {
        Self {
            next_seq: 1,
            max_lines: max_lines.max(1),
            evicted: 0,
            lines: VecDeque::new(),
        }
    }

    fn push(&mut self, channel: OutputChannel, text: String) -> OutputLine {
        let line = OutputLine {
            seq: self.next_seq,
            at_unix_ms: now_unix_ms(),
            channel,
            text,
        };
        self.next_seq = self.next_seq.saturating_add(1);
        self.lines.push_back(line.clone());
        while self.lines.len() > self.max_lines {
            self.lines.pop_front();
            self.evicted = self.evicted.saturating_add(1);
        }
        line
    }

    fn tail_after(&self, cursor: u64, limit: usize) -> (Vec<OutputLine>, u64) {
        // cursor 0 means "the most recent lines".
        if cursor == 0 {
            let start = self.lines.len().saturating_sub(limit);
            let out: Vec<OutputLine> = self.lines.iter().skip(start).cloned().collect();
            let last = out.last().map(|l| l.seq).unwrap_or(0);
            return (out, last);
        }

        let mut out = Vec::new();
        let mut last = cursor;
        for line in self.lines.iter().filter(|l| l.seq > cursor) {
            out.push(line.clone());
            last = line.seq;
            if out.len() >= limit {
                break;
            }
        }
        (out, last)
    }
}

struct Channel {
    ring: OutputRing,
    live: broadcast::Sender<OutputLine>,
    /// Run currently publishing here; 0 while idle.
    run: u64,
    console: Option<ConsoleWriter>,
}

type ChannelRef = Arc<Mutex<Channel>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelStats {
    pub next_seq: u64,
    pub buffered: usize,
    pub evicted: u64,
    pub subscribers: usize,
}

/// Output fan-out for every supervised server.
pub struct Broadcaster {
    max_lines: usize,
    subscriber_capacity: usize,
    channels: Mutex<HashMap<ServerId, ChannelRef>>,
}

impl Broadcaster {
    pub fn new(max_lines: usize, subscriber_capacity: usize) -> Self {
        Self {
            max_lines,
            subscriber_capacity: subscriber_capacity.max(1),
            channels: Mutex::new(HashMap::new()),
        }
    }

    fn channel(&self, id: &ServerId) -> ChannelRef {
        lock(&self.channels)
            .entry(id.clone())
            .or_insert_with(|| {
                let (live, _) = broadcast::channel(self.subscriber_capacity);
                Arc::new(Mutex::new(Channel {
                    ring: OutputRing::new(self.max_lines),
                    live,
                    run: 0,
                    console: None,
                }))
            })
            .clone()
    }

    fn existing(&self, id: &ServerId) -> Option<ChannelRef> {
        lock(&self.channels).get(id).cloned()
    }

    /// Prepare the channel for run `run`, optionally mirroring it into a console file.
    pub fn open(&self, id: &ServerId, run: u64, console_file: Option<(PathBuf, ConsoleLogConfig)>) {
        let channel = self.channel(id);
        let mut ch = lock(&channel);
        ch.run = run;
        ch.console = console_file.map(|(path, limits)| console_log::spawn_writer(path, limits));
    }

    /// Append a line and deliver it to live subscribers.
    ///
    /// Returns `None` when the channel was already closed.
    pub fn publish(
        &self,
        id: &ServerId,
        channel: OutputChannel,
        text: impl Into<String>,
    ) -> Option<OutputLine> {
        let ch = self.existing(id)?;
        let mut ch = lock(&ch);
        let line = ch.ring.push(channel, text.into());
        // No receivers is fine; late subscribers replay from the ring.
        let _ = ch.live.send(line.clone());
        if let Some(console) = ch.console.as_mut() {
            console.write(line.display_line());
        }
        Some(line)
    }

    /// Subscribe to `id`, creating an idle channel if none exists yet.
    pub fn subscribe(&self, id: &ServerId, with_backlog: bool) -> Subscription {
        let channel = self.channel(id);
        let ch = lock(&channel);
        let backlog = if with_backlog {
            ch.ring.lines.iter().cloned().collect()
        } else {
            VecDeque::new()
        };
        Subscription {
            server_id: id.clone(),
            backlog,
            live: ch.live.subscribe(),
            dropped_count: 0,
        }
    }

    pub fn tail_after(&self, id: &ServerId, cursor: u64, limit: usize) -> (Vec<OutputLine>, u64) {
        match self.existing(id) {
            Some(ch) => lock(&ch).ring.tail_after(cursor, limit),
            None => (Vec::new(), cursor),
        }
    }

    pub fn stats(&self, id: &ServerId) -> Option<ChannelStats> {
        let ch = self.existing(id)?;
        let ch = lock(&ch);
        Some(ChannelStats {
            next_seq: ch.ring.next_seq,
            buffered: ch.ring.lines.len(),
            evicted: ch.ring.evicted,
            subscribers: ch.live.receiver_count(),
        })
    }

    /// Publish a last line for `run` and close its channel.
    ///
    /// Does nothing once another run has opened the channel.
    pub fn finish_run(&self, id: &ServerId, run: u64, text: impl Into<String>) {
        let mut channels = lock(&self.channels);
        let Some(channel) = channels.get(id).cloned() else {
            return;
        };
        let mut ch = lock(&channel);
        if ch.run != run {
            return;
        }
        let line = ch.ring.push(OutputChannel::System, text.into());
        let _ = ch.live.send(line.clone());
        if let Some(console) = ch.console.as_mut() {
            console.write(line.display_line());
        }
        channels.remove(id);
        tracing::debug!(
            server_id = %id,
            run,
            subscribers = ch.live.receiver_count(),
            "output channel finished"
        );
    }

    /// Whether `id` currently has a channel (open run or waiting subscribers).
    pub fn contains(&self, id: &ServerId) -> bool {
        lock(&self.channels).contains_key(id)
    }

    /// Tear down the channel: subscribers drain what they hold, then see end of stream.
    pub fn close(&self, id: &ServerId) {
        let removed = lock(&self.channels).remove(id);
        if let Some(ch) = removed {
            let ch = lock(&ch);
            tracing::debug!(
                server_id = %id,
                subscribers = ch.live.receiver_count(),
                "output channel closed"
            );
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Line(OutputLine),
    /// This subscriber fell behind and `count` lines were skipped.
    Dropped { count: u64 },
}

/// Live view of one server's output.
pub struct Subscription {
    server_id: ServerId,
    backlog: VecDeque<OutputLine>,
    live: broadcast::Receiver<OutputLine>,
    dropped_count: u64,
}

impl Subscription {
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Total lines this subscriber has missed by lagging.
    pub fn dropped_count(&self) -> u64 {
        self.dropped_count
    }

    /// Next item, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<StreamItem> {
        if let Some(line) = self.backlog.pop_front() {
            return Some(StreamItem::Line(line));
        }
        match self.live.recv().await {
            Ok(line) => Some(StreamItem::Line(line)),
            Err(broadcast::error::RecvError::Lagged(count)) => {
                self.dropped_count = self.dropped_count.saturating_add(count);
                Some(StreamItem::Dropped { count })
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = StreamItem> + Send + 'static {
        futures_util::stream::unfold(self, |mut sub| async move {
            let item = sub.recv().await?;
            Some((item, sub))
        })
    }
}
