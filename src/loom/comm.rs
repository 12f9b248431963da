use std::{
    collections::VecDeque,
    ops::Range,
    sync::{Arc, Mutex},
};

use derive_more::{Display, From, Into};
use rustc_hash::FxHashMap as HashMap;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::platform::BoxFuture;

/// Distributed identity of a tile handle. The same tile carries the same tag on every rank.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Into,
)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Tag(pub u64);

impl Tag {
    #[inline]
    pub fn offset(self, offset: usize) -> Self {
        Self(self.0 + offset as u64)
    }
}

#[derive(Debug, Error)]
pub enum CommError {
    #[error("rank {0} out of range for a world of size {1}")]
    Rank(usize, usize),
    #[error("transport closed before message {1} from rank {0} arrived")]
    Closed(usize, Tag),
}

/// Point-to-point message passing between ranks.
///
/// Messages are matched by `(source rank, tag)`; messages with the same key are
/// delivered in the order they were sent.
pub trait Transport: std::fmt::Debug + Send + Sync {
    /// Rank of the calling process.
    fn rank(&self) -> usize;
    /// Number of ranks in the world.
    fn size(&self) -> usize;
    /// Sends `payload` to `dst` without waiting for it to be received.
    fn send(&self, dst: usize, tag: Tag, payload: Box<[u8]>) -> Result<(), CommError>;
    /// Resolves with the next message from `src` carrying `tag`.
    fn recv(&self, src: usize, tag: Tag) -> BoxFuture<'static, Result<Box<[u8]>, CommError>>;
    /// Forgets every pending message and receive addressed to this rank with a tag in `tags`.
    fn retire(&self, tags: Range<Tag>);
}

type Key = (usize, Tag);

#[derive(Debug, Default)]
struct Mailbox {
    messages: HashMap<Key, VecDeque<Box<[u8]>>>,
    waiters: HashMap<Key, VecDeque<flume::Sender<Box<[u8]>>>>,
}

impl Mailbox {
    fn pop_message(&mut self, key: Key) -> Option<Box<[u8]>> {
        let queue = self.messages.get_mut(&key)?;
        let payload = queue.pop_front();
        if queue.is_empty() {
            self.messages.remove(&key);
        }
        payload
    }

    fn pop_waiter(&mut self, key: Key) -> Option<flume::Sender<Box<[u8]>>> {
        let queue = self.waiters.get_mut(&key)?;
        let waiter = queue.pop_front();
        if queue.is_empty() {
            self.waiters.remove(&key);
        }
        waiter
    }
}

/// In-process world of ranks, one mailbox per rank.
/// Lets a single process simulate a cluster: build one runtime per rank.
#[derive(Debug, Clone)]
pub struct LocalCluster {
    rank: usize,
    mailboxes: Arc<[Mutex<Mailbox>]>,
}

impl LocalCluster {
    /// Creates a world of `size` ranks; element `i` is the endpoint of rank `i`.
    pub fn new(size: usize) -> Vec<Self> {
        let mailboxes: Arc<[Mutex<Mailbox>]> = (0..size).map(|_| Default::default()).collect();
        (0..size)
            .map(|rank| Self {
                rank,
                mailboxes: mailboxes.clone(),
            })
            .collect()
    }

    /// A world with a single rank.
    pub fn solo() -> Self {
        Self::new(1).remove(0)
    }
}

impl Transport for LocalCluster {
    #[inline]
    fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    fn size(&self) -> usize {
        self.mailboxes.len()
    }

    fn send(&self, dst: usize, tag: Tag, payload: Box<[u8]>) -> Result<(), CommError> {
        let mailbox = self
            .mailboxes
            .get(dst)
            .ok_or(CommError::Rank(dst, self.size()))?;
        let mut mailbox = mailbox.lock().expect("failed to lock mailbox");
        let key = (self.rank, tag);

        let mut payload = payload;
        while let Some(waiter) = mailbox.pop_waiter(key) {
            match waiter.send(payload) {
                Ok(()) => return Ok(()),
                // the receiving future was dropped; try the next one
                Err(flume::SendError(back)) => payload = back,
            }
        }
        mailbox.messages.entry(key).or_default().push_back(payload);
        Ok(())
    }

    fn recv(&self, src: usize, tag: Tag) -> BoxFuture<'static, Result<Box<[u8]>, CommError>> {
        if src >= self.size() {
            let err = CommError::Rank(src, self.size());
            return Box::pin(futures::future::ready(Err(err)));
        }
        let key = (src, tag);
        let mut mailbox = self.mailboxes[self.rank]
            .lock()
            .expect("failed to lock mailbox");

        if let Some(payload) = mailbox.pop_message(key) {
            return Box::pin(futures::future::ready(Ok(payload)));
        }

        let (sender, receiver) = flume::bounded(1);
        mailbox.waiters.entry(key).or_default().push_back(sender);
        Box::pin(async move {
            receiver
                .recv_async()
                .await
                .map_err(|_| CommError::Closed(src, tag))
        })
    }

    fn retire(&self, tags: Range<Tag>) {
        let mut mailbox = self.mailboxes[self.rank]
            .lock()
            .expect("failed to lock mailbox");
        let before = mailbox.messages.len();
        mailbox.messages.retain(|(_, tag), _| !tags.contains(tag));
        mailbox.waiters.retain(|(_, tag), _| !tags.contains(tag));
        if mailbox.messages.len() != before {
            log::warn!(
                "rank {}: dropped undelivered messages for tags {}..{}",
                self.rank,
                tags.start,
                tags.end
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;

    use super::{CommError, LocalCluster, Tag, Transport};

    #[tokio::test]
    async fn test_send_before_recv() -> Result<(), Box<dyn Error>> {
        let world = LocalCluster::new(2);
        world[0].send(1, Tag(7), vec![1, 2, 3].into())?;
        world[0].send(1, Tag(7), vec![4].into())?;

        assert_eq!(&*world[1].recv(0, Tag(7)).await?, &[1, 2, 3]);
        assert_eq!(&*world[1].recv(0, Tag(7)).await?, &[4]);
        Ok(())
    }

    #[tokio::test]
    async fn test_recv_before_send() -> Result<(), Box<dyn Error>> {
        let world = LocalCluster::new(3);
        let a = world[2].recv(0, Tag(1));
        let b = world[2].recv(1, Tag(1));

        world[1].send(2, Tag(1), vec![1].into())?;
        world[0].send(2, Tag(1), vec![0].into())?;

        assert_eq!(&*a.await?, &[0]);
        assert_eq!(&*b.await?, &[1]);
        Ok(())
    }

    #[tokio::test]
    async fn test_tags_do_not_mix() -> Result<(), Box<dyn Error>> {
        let world = LocalCluster::new(2);
        world[1].send(0, Tag(2), vec![2].into())?;
        world[1].send(0, Tag(1), vec![1].into())?;

        assert_eq!(&*world[0].recv(1, Tag(1)).await?, &[1]);
        assert_eq!(&*world[0].recv(1, Tag(2)).await?, &[2]);
        Ok(())
    }

    #[test]
    fn test_invalid_rank() {
        let world = LocalCluster::new(2);
        let err = world[0].send(2, Tag(0), vec![].into());
        assert!(matches!(err, Err(CommError::Rank(2, 2))));
    }

    #[tokio::test]
    async fn test_retire() -> Result<(), Box<dyn Error>> {
        let world = LocalCluster::new(2);
        world[0].send(1, Tag(3), vec![3].into())?;
        world[0].send(1, Tag(10), vec![10].into())?;
        world[1].retire(Tag(0)..Tag(5));

        world[0].send(1, Tag(3), vec![4].into())?;
        assert_eq!(&*world[1].recv(0, Tag(3)).await?, &[4]);
        assert_eq!(&*world[1].recv(0, Tag(10)).await?, &[10]);
        Ok(())
    }
}
