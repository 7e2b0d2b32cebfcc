use std::thread;

/// # Pill
///
/// A panic propagation mechanism that surfaces panics from worker tasks to
/// the thread that eventually drops the pill.
///
/// ## Usage Pattern
///
/// 1. Create a `Pill` on the spawning side
/// 2. Move it into the worker task
/// 3. If the worker panics, the `Pill` is dropped during unwinding and
///    re-raises, so the failure is not silently swallowed by the runtime
pub struct Pill {}

impl Pill {
    /// Creates a new `Pill` instance.
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self {}
    }
}

impl Drop for Pill {
    /// Detects if this `Pill` is being dropped due to a panic and propagates
    /// the panic if so.
    fn drop(&mut self) {
        if thread::panicking() {
            panic!("worker task panicked - propagating panic");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    #[test]
    fn pill_does_not_panic_in_normal_case() {
        {
            let _pill = Pill::new();
        }
    }

    #[test]
    fn pill_survives_transfer_across_threads() {
        let (sender, receiver) = mpsc::channel();

        let worker = thread::spawn(move || {
            let pill = Pill::new();
            sender.send(pill).unwrap();
        });

        let pill = receiver.recv().unwrap();
        worker.join().unwrap();
        drop(pill);
    }
}
