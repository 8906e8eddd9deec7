/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::cell::{Cell, UnsafeCell};
use std::marker::PhantomData;
use std::mem::MaybeUninit;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    Arc,
};

use super::Error;
use crate::counter as stats;

/// Creates a fixed size single-producer single-consumer queue.
///
/// Neither end ever blocks: `send` on a full queue hands the message back in
/// `Error::Full`, `recv` on an empty queue returns `Error::Empty`. Capacity is
/// exactly `size`, it is not rounded up.
pub fn bounded<T>(size: usize) -> (Sender<T>, Receiver<T>, StatsHandle<T>) {
    assert!(size > 0, "queue size must be positive");
    let queue = Arc::new(SpscQueue::with_capacity(size));
    (
        Sender {
            queue: queue.clone(),
            _not_sync: PhantomData,
        },
        Receiver {
            queue: queue.clone(),
            _not_sync: PhantomData,
        },
        StatsHandle { queue },
    )
}

#[derive(Debug, Default)]
pub struct Counter {
    pub input: AtomicU64,
    pub output: AtomicU64,
    pub dropped: AtomicU64,
}

struct SpscQueue<T> {
    size: usize,

    buffer: Box<[UnsafeCell<MaybeUninit<T>>]>,

    // positions wrap at 2 * size so that a full queue can be told from an empty one
    // start is only stored by the consumer, end only by the producer
    start: AtomicUsize,
    end: AtomicUsize,

    terminated: AtomicBool,

    counter: Counter,
}

unsafe impl<T: Send> Send for SpscQueue<T> {}
unsafe impl<T: Send> Sync for SpscQueue<T> {}

impl<T> SpscQueue<T> {
    fn with_capacity(size: usize) -> Self {
        let buffer = (0..size)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            size,
            buffer,
            start: AtomicUsize::new(0),
            end: AtomicUsize::new(0),
            terminated: AtomicBool::new(false),
            counter: Counter::default(),
        }
    }

    fn pending(&self, start: usize, end: usize) -> usize {
        let end = if end < start { end + 2 * self.size } else { end };
        end - start
    }

    fn advance(&self, pos: usize) -> usize {
        if pos + 1 == 2 * self.size {
            0
        } else {
            pos + 1
        }
    }

    fn len(&self) -> usize {
        let start = self.start.load(Ordering::Acquire);
        let end = self.end.load(Ordering::Acquire);
        self.pending(start, end)
    }

    // must only be called from the single producer
    unsafe fn push(&self, msg: T) -> Result<(), Error<T>> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(Error::Terminated(Some(msg)));
        }
        let end = self.end.load(Ordering::Relaxed);
        let start = self.start.load(Ordering::Acquire);
        let pending = self.pending(start, end);
        assert!(pending <= self.size);
        if pending == self.size {
            self.counter.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(Error::Full(msg));
        }
        (*self.buffer[end % self.size].get()).write(msg);
        self.end.store(self.advance(end), Ordering::Release);
        self.counter.input.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    // must only be called from the single consumer
    unsafe fn pop(&self) -> Result<T, Error<T>> {
        let start = self.start.load(Ordering::Relaxed);
        let end = self.end.load(Ordering::Acquire);
        if start == end {
            if self.terminated.load(Ordering::Acquire) {
                // re-check, the producer may have pushed right before terminating
                if self.end.load(Ordering::Acquire) == start {
                    return Err(Error::Terminated(None));
                }
            } else {
                return Err(Error::Empty);
            }
        }
        let msg = (*self.buffer[start % self.size].get()).assume_init_read();
        self.start.store(self.advance(start), Ordering::Release);
        self.counter.output.fetch_add(1, Ordering::Relaxed);
        Ok(msg)
    }

    fn close(&self) {
        self.terminated.store(true, Ordering::Release);
    }
}

impl<T> Drop for SpscQueue<T> {
    fn drop(&mut self) {
        let start = *self.start.get_mut();
        let end = *self.end.get_mut();
        let mut pos = start;
        for _ in 0..self.pending(start, end) {
            unsafe {
                (*self.buffer[pos % self.size].get()).assume_init_drop();
            }
            pos = self.advance(pos);
        }
    }
}

pub struct Sender<T> {
    queue: Arc<SpscQueue<T>>,
    // one producer only: the handle may move between threads but not be shared
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> Sender<T> {
    pub fn send(&self, msg: T) -> Result<(), Error<T>> {
        unsafe { self.queue.push(msg) }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

pub struct Receiver<T> {
    queue: Arc<SpscQueue<T>>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T> Receiver<T> {
    pub fn recv(&self) -> Result<T, Error<T>> {
        unsafe { self.queue.pop() }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.queue.close();
    }
}

pub struct StatsHandle<T> {
    queue: Arc<SpscQueue<T>>,
}

impl<T: Send> stats::OwnedCountable for StatsHandle<T> {
    fn get_counters(&self) -> Vec<stats::Counter> {
        let counter = &self.queue.counter;
        vec![
            (
                "in",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(counter.input.swap(0, Ordering::Relaxed)),
            ),
            (
                "out",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(counter.output.swap(0, Ordering::Relaxed)),
            ),
            (
                "dropped",
                stats::CounterType::Counted,
                stats::CounterValue::Unsigned(counter.dropped.swap(0, Ordering::Relaxed)),
            ),
            (
                "pending",
                stats::CounterType::Gauged,
                stats::CounterValue::Unsigned(self.queue.len() as u64),
            ),
        ]
    }

    fn closed(&self) -> bool {
        self.queue.terminated.load(Ordering::Relaxed)
    }
}
