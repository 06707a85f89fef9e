// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! A bounded late-joiner cache with GOP-granular eviction.
//!
//! The writer marks each item as a keyframe or not. Items preceding the
//! first keyframe are dropped, every retained group of pictures starts with
//! a keyframe, and eviction removes whole groups from the front. A consumer
//! that subscribes mid-stream first receives the cached groups in order, so
//! its stream always begins at a sync point.

use std::collections::VecDeque;

use parking_lot::Mutex;

/// Total cached item cap before whole-GOP eviction kicks in.
const DEFAULT_MAX_SIZE: usize = 512;

/// Retained GOP cap.
const DEFAULT_MAX_GOPS: usize = 2;

type DataCallback<T> = Box<dyn FnMut(&T) + Send>;

/// A concurrent GOP-aware ring buffer.
///
/// All operations take a single internal lock. The data callback runs *with
/// that lock held*, both for live writes and for the replay performed by
/// [`Ring::set_on_data`]; calling back into the ring from inside the
/// callback deadlocks. Hand the item off (e.g. over a channel) instead of
/// doing real work there.
pub struct Ring<T> {
    state: Mutex<State<T>>,
}

struct State<T> {
    max_size: usize,
    max_gops: usize,

    /// Sum of the lengths of `gops`.
    size: usize,

    /// Whether any keyframe has ever been written. Until then everything is
    /// dropped: a consumer could not decode it anyway.
    have_key: bool,

    /// Invariant: non-empty; each non-empty GOP starts with a keyframe.
    gops: VecDeque<Vec<T>>,

    on_data: Option<DataCallback<T>>,
}

impl<T> Default for Ring<T> {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_SIZE, DEFAULT_MAX_GOPS)
    }
}

impl<T> Ring<T> {
    /// Creates a ring holding at most `max_size` items across at most
    /// `max_gops` groups of pictures.
    pub fn new(max_size: usize, max_gops: usize) -> Self {
        let mut gops = VecDeque::new();
        gops.push_back(Vec::new());
        Self {
            state: Mutex::new(State {
                max_size,
                max_gops,
                size: 0,
                have_key: false,
                gops,
                on_data: None,
            }),
        }
    }

    /// Appends one item, starting a fresh GOP first when `is_key`.
    ///
    /// Items written before the first keyframe are silently dropped. After
    /// appending, the oldest whole GOPs are evicted until both caps hold
    /// again (the trailing GOP is never evicted, so a single oversized GOP
    /// may transiently exceed `max_size`).
    pub fn write(&self, item: T, is_key: bool) {
        let mut state = self.state.lock();
        let state = &mut *state;

        if is_key {
            state.have_key = true;
            if !state.gops.back().map_or(true, Vec::is_empty) {
                state.gops.push_back(Vec::new());
            }
            while state.gops.len() > state.max_gops {
                let evicted = state.gops.pop_front().expect("gops is non-empty");
                state.size -= evicted.len();
            }
        }

        if !state.have_key {
            return;
        }

        state.gops.back_mut().expect("gops is non-empty").push(item);
        state.size += 1;

        while state.size > state.max_size && state.gops.len() > 1 {
            let evicted = state.gops.pop_front().expect("gops.len() > 1");
            state.size -= evicted.len();
        }

        if let Some(cb) = state.on_data.as_mut() {
            let newest = state
                .gops
                .back()
                .and_then(|gop| gop.last())
                .expect("just pushed");
            cb(newest);
        }
    }

    /// Installs the data callback, replacing any previous one, and
    /// immediately replays every cached item into it in order.
    ///
    /// The replay guarantees the consumer observes a keyframe before any
    /// non-keyframe, and it happens under the lock: no live `write` can
    /// interleave with it.
    pub fn set_on_data<F: FnMut(&T) + Send + 'static>(&self, cb: F) {
        let mut state = self.state.lock();
        let mut cb: DataCallback<T> = Box::new(cb);
        for gop in &state.gops {
            for item in gop {
                cb(item);
            }
        }
        state.on_data = Some(cb);
    }

    /// Number of cached items.
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Drops all cached items and forgets that a keyframe was ever seen.
    /// The installed callback, if any, is kept.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.gops.clear();
        state.gops.push_back(Vec::new());
        state.size = 0;
        state.have_key = false;
    }
}
