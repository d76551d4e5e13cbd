//! Process-wide engine handle.

use std::time::{Duration, Instant};

use log::debug;

use crate::config::Config;
use crate::error::Error;
use crate::eventloop::EventLoop;

/// Owns the event loops of this process: one per core by default, each
/// pinned (when configured) and running the same reactor backend.
pub struct TpcEngine {
    loops: Vec<EventLoop>,
}

impl TpcEngine {
    /// Construct the loops without starting them.
    pub fn new(config: Config) -> Result<TpcEngine, Error> {
        config.validate()?;
        let count = if config.eventloops == 0 {
            num_cpus()
        } else {
            config.eventloops
        };
        let mut loops = Vec::with_capacity(count);
        for index in 0..count {
            loops.push(EventLoop::new(index, &config)?);
        }
        Ok(TpcEngine { loops })
    }

    pub fn eventloop_count(&self) -> usize {
        self.loops.len()
    }

    /// Loop `index`; panics when out of range.
    pub fn eventloop(&self, index: usize) -> &EventLoop {
        &self.loops[index]
    }

    pub fn eventloops(&self) -> &[EventLoop] {
        &self.loops
    }

    /// Spawn every loop's owner thread. On failure the already-started
    /// loops are shut down again.
    pub fn start(&self) -> Result<(), Error> {
        for (index, eventloop) in self.loops.iter().enumerate() {
            if let Err(e) = eventloop.start() {
                for started in &self.loops[..index] {
                    started.shutdown();
                }
                return Err(e);
            }
        }
        debug!("engine started with {} loops", self.loops.len());
        Ok(())
    }

    /// Request termination of every loop. Idempotent.
    pub fn shutdown(&self) {
        for eventloop in &self.loops {
            eventloop.shutdown();
        }
    }

    /// Wait until every loop terminated, sharing one deadline.
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for eventloop in &self.loops {
            let now = Instant::now();
            let left = if deadline > now {
                deadline - now
            } else {
                Duration::ZERO
            };
            if !eventloop.await_termination(left) {
                return false;
            }
        }
        true
    }
}

/// Number of online CPU cores.
fn num_cpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if ret < 1 {
        1
    } else {
        ret as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConfigBuilder, ReactorKind};

    #[test]
    fn builds_requested_loop_count() {
        let config = ConfigBuilder::new()
            .reactor(ReactorKind::Portable)
            .eventloops(3)
            .build()
            .unwrap();
        let engine = TpcEngine::new(config).unwrap();
        assert_eq!(engine.eventloop_count(), 3);
        for i in 0..3 {
            assert_eq!(engine.eventloop(i).index(), i);
        }
        engine.shutdown();
        assert!(engine.await_termination(Duration::from_secs(1)));
    }

    #[test]
    fn zero_means_cpu_count() {
        let config = ConfigBuilder::new()
            .reactor(ReactorKind::Portable)
            .build()
            .unwrap();
        let engine = TpcEngine::new(config).unwrap();
        assert!(engine.eventloop_count() >= 1);
        engine.shutdown();
    }
}
