//! Depth-1 mailbox that forces events arriving from several producers into a
//! single sequential timeline.
//!
//! `submit` either runs the handler inline or, when a handler invocation is
//! already in flight, parks the event in the single pending slot. The caller
//! that owns the active invocation drains the slot before going idle, so the
//! handler never runs concurrently with itself.

use std::sync::Mutex;

use tracing::warn;

pub trait Handler<E> {
    fn handle(&mut self, event: E);
}

impl<E, F> Handler<E> for F
where
    F: FnMut(E),
{
    fn handle(&mut self, event: E) {
        self(event)
    }
}

/// What `submit` did with the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Processed inline, together with anything queued meanwhile
    Handled,
    /// Parked in the empty pending slot
    Queued,
    /// Parked in the pending slot, displacing an unprocessed event
    Replaced,
}

struct Slot<E> {
    active: bool,
    pending: Option<E>,
}

pub struct Mailbox<H, E> {
    slot: Mutex<Slot<E>>,
    handler: Mutex<H>,
}

impl<H, E> Mailbox<H, E>
where
    H: Handler<E>,
{
    pub fn new(handler: H) -> Self {
        Self {
            slot: Mutex::new(Slot {
                active: false,
                pending: None,
            }),
            handler: Mutex::new(handler),
        }
    }

    pub fn submit(&self, event: E) -> Delivery {
        {
            let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.active {
                return match slot.pending.replace(event) {
                    Some(_) => {
                        warn!("Mailbox pending slot overwritten, producer outran the handler");
                        Delivery::Replaced
                    }
                    None => Delivery::Queued,
                };
            }
            slot.active = true;
        }

        let mut next = Some(event);
        while let Some(event) = next {
            {
                let mut handler = self
                    .handler
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                handler.handle(event);
            }

            let mut slot = self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            next = slot.pending.take();
            if next.is_none() {
                slot.active = false;
            }
        }

        Delivery::Handled
    }

    pub fn is_active(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .active
    }

    /// Run `f` against the handler between events.
    pub fn with_handler<R>(&self, f: impl FnOnce(&mut H) -> R) -> R {
        let mut handler = self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut handler)
    }

    pub fn into_inner(self) -> H {
        self.handler
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_idle_mailbox_handles_inline() {
        let mut seen = Vec::new();
        let mailbox = Mailbox::new(move |e: u32| seen.push(e));
        assert_eq!(mailbox.submit(1), Delivery::Handled);
        assert_eq!(mailbox.submit(2), Delivery::Handled);
        assert!(!mailbox.is_active());
    }

    struct Recorder {
        seen: Vec<u32>,
    }

    impl Handler<u32> for Recorder {
        fn handle(&mut self, event: u32) {
            self.seen.push(event);
        }
    }

    #[test]
    fn test_sequential_order_preserved() {
        let mailbox = Mailbox::new(Recorder { seen: Vec::new() });
        for e in 0..5 {
            mailbox.submit(e);
        }
        assert_eq!(mailbox.into_inner().seen, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_busy_mailbox_buffers_one_event() {
        let (started_tx, started_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handler_seen = seen.clone();
        let mailbox = Arc::new(Mailbox::new(move |e: u32| {
            handler_seen.lock().unwrap().push(e);
            if e == 1 {
                started_tx.send(()).unwrap();
                release_rx.recv().unwrap();
            }
        }));

        let producer = {
            let mailbox = mailbox.clone();
            thread::spawn(move || mailbox.submit(1))
        };

        started_rx.recv().unwrap();
        assert!(mailbox.is_active());
        assert_eq!(mailbox.submit(2), Delivery::Queued);
        assert_eq!(mailbox.submit(3), Delivery::Replaced);
        release_tx.send(()).unwrap();

        assert_eq!(producer.join().unwrap(), Delivery::Handled);
        assert_eq!(*seen.lock().unwrap(), vec![1, 3]);
        assert!(!mailbox.is_active());
    }

    #[test]
    fn test_handler_never_reenters() {
        let in_handler = Arc::new(AtomicBool::new(false));
        let handled = Arc::new(AtomicUsize::new(0));

        let guard = in_handler.clone();
        let count = handled.clone();
        let mailbox = Arc::new(Mailbox::new(move |_: usize| {
            assert!(!guard.swap(true, Ordering::SeqCst), "handler re-entered");
            thread::sleep(Duration::from_millis(1));
            count.fetch_add(1, Ordering::SeqCst);
            guard.store(false, Ordering::SeqCst);
        }));

        let producers: Vec<_> = (0..8)
            .map(|i| {
                let mailbox = mailbox.clone();
                thread::spawn(move || {
                    for j in 0..20 {
                        mailbox.submit(i * 100 + j);
                    }
                })
            })
            .collect();
        for p in producers {
            p.join().unwrap();
        }

        let handled = handled.load(Ordering::SeqCst);
        assert!(handled >= 1 && handled <= 160);
        assert!(!mailbox.is_active());
    }

    #[test]
    fn test_submit_from_inside_handler_is_queued() {
        let mailbox: Arc<Mutex<Option<Arc<Mailbox<Box<dyn FnMut(u32) + Send>, u32>>>>> =
            Arc::new(Mutex::new(None));
        let seen = Arc::new(Mutex::new(Vec::new()));

        let weak_mb = mailbox.clone();
        let handler_seen = seen.clone();
        let handler: Box<dyn FnMut(u32) + Send> = Box::new(move |e| {
            handler_seen.lock().unwrap().push(e);
            if e == 1 {
                let mb = weak_mb.lock().unwrap().clone().unwrap();
                assert_eq!(mb.submit(2), Delivery::Queued);
            }
        });
        let mb = Arc::new(Mailbox::new(handler));
        *mailbox.lock().unwrap() = Some(mb.clone());

        assert_eq!(mb.submit(1), Delivery::Handled);
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        mailbox.lock().unwrap().take();
    }
}
