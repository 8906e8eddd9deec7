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

use std::fmt::{self, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{info, warn};

pub use public::counter::*;

const MIN_INTERVAL: Duration = Duration::from_secs(1);

pub enum StatsOption {
    Tag(&'static str, String),
}

struct Source {
    module: &'static str,
    countable: Countable,
    tags: Vec<(&'static str, String)>,
}

impl PartialEq for Source {
    fn eq(&self, other: &Source) -> bool {
        self.module == other.module && self.tags == other.tags
    }
}

impl Eq for Source {}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}-{:?}", self.module, self.tags)
    }
}

impl Source {
    // module{k=v,k=v} name=value name=value
    fn render(&self, points: &[Counter]) -> String {
        let mut line = String::from(self.module);
        if !self.tags.is_empty() {
            line.push('{');
            for (i, (k, v)) in self.tags.iter().enumerate() {
                if i > 0 {
                    line.push(',');
                }
                let _ = write!(line, "{}={}", k, v);
            }
            line.push('}');
        }
        for (name, _, value) in points {
            let _ = write!(line, " {}={}", name, value);
        }
        line
    }
}

/// Periodically drains every registered countable and logs its counters.
pub struct Collector {
    interval: Duration,
    sources: Arc<Mutex<Vec<Source>>>,
    running: Arc<(Mutex<bool>, Condvar)>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Collector {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_INTERVAL),
            sources: Arc::new(Mutex::new(vec![])),
            running: Arc::new((Mutex::new(false), Condvar::new())),
            thread: Mutex::new(None),
        }
    }

    pub fn register_countable(
        &self,
        module: &'static str,
        countable: Countable,
        options: Vec<StatsOption>,
    ) {
        let mut source = Source {
            module,
            countable,
            tags: vec![],
        };
        for option in options {
            match option {
                StatsOption::Tag(k, v) if !source.tags.iter().any(|(key, _)| key == &k) => {
                    source.tags.push((k, v))
                }
                _ => warn!("ignored duplicated tag for module {}", source.module),
            }
        }
        let mut sources = self.sources.lock().unwrap();
        sources.retain(|s| {
            let closed = s.countable.closed();
            let equals = s == &source;
            if !closed && equals {
                warn!(
                    "Found duplicated counter source {}, please check if the old one is correctly closed.",
                    source
                );
            }
            !closed && !equals
        });
        sources.push(source);
    }

    fn collect(sources: &Mutex<Vec<Source>>) -> Vec<String> {
        let mut sources = sources.lock().unwrap();
        sources.retain(|s| !s.countable.closed());
        sources
            .iter()
            .filter_map(|s| {
                let points = s.countable.get_counters();
                if points.is_empty() {
                    None
                } else {
                    Some(s.render(&points))
                }
            })
            .collect()
    }

    pub fn start(&self) {
        {
            let (started, _) = &*self.running;
            let mut started = started.lock().unwrap();
            if *started {
                return;
            }
            *started = true;
        }

        let running = self.running.clone();
        let sources = self.sources.clone();
        let interval = self.interval;
        *self.thread.lock().unwrap() = Some(
            thread::Builder::new()
                .name("stats-collector".to_owned())
                .spawn(move || loop {
                    {
                        let (running, timer) = &*running;
                        let mut running = running.lock().unwrap();
                        if !*running {
                            break;
                        }
                        running = timer.wait_timeout(running, interval).unwrap().0;
                        if !*running {
                            break;
                        }
                    }
                    for line in Self::collect(&sources) {
                        info!("{}", line);
                    }
                })
                .unwrap(),
        );
    }

    pub fn notify_stop(&self) -> Option<JoinHandle<()>> {
        let (running, timer) = &*self.running;
        *running.lock().unwrap() = false;
        timer.notify_all();
        self.thread.lock().unwrap().take()
    }

    pub fn stop(&self) {
        if let Some(handle) = self.notify_stop() {
            let _ = handle.join();
        }
    }
}

impl Drop for Collector {
    fn drop(&mut self) {
        self.stop();
    }
}
