//! Change subscribers for a control loop.
//!
//! A subscriber gets the current state once, when it registers, through
//! whatever reply the loop uses for that; after that it gets every change
//! here. Subscribers whose receiver is gone are dropped on the next notify.

use crossbeam_channel::Sender;

pub struct Registrants<T> {
    subscribers: Vec<Sender<T>>,
}

impl<T: Clone> Registrants<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Vec::new(),
        }
    }

    pub fn add(&mut self, tx: Sender<T>) {
        self.subscribers.push(tx);
    }

    pub fn notify(&mut self, notice: &T) {
        self.subscribers.retain(|tx| tx.send(notice.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl<T: Clone> Default for Registrants<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_reaches_every_live_subscriber() {
        let mut reg = Registrants::new();
        let (tx1, rx1) = crossbeam_channel::unbounded();
        let (tx2, rx2) = crossbeam_channel::unbounded();
        reg.add(tx1);
        reg.add(tx2);
        reg.notify(&7u32);
        assert_eq!(rx1.try_recv().unwrap(), 7);
        assert_eq!(rx2.try_recv().unwrap(), 7);
    }

    #[test]
    fn dead_subscribers_are_pruned() {
        let mut reg = Registrants::new();
        let (tx1, rx1) = crossbeam_channel::unbounded();
        let (tx2, rx2) = crossbeam_channel::unbounded::<u32>();
        reg.add(tx1);
        reg.add(tx2);
        drop(rx2);
        reg.notify(&1);
        assert_eq!(reg.len(), 1);
        assert_eq!(rx1.try_recv().unwrap(), 1);
    }
}
