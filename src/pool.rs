//! Generic bounded resource pool.
//!
//! Items are created lazily through an async factory, up to `max_size` live
//! at once. An item that closes (on its own or via the pool) stops counting
//! toward the limit as soon as its close-notify token fires.
//!
//! # Example
//!
//! ```ignore
//! let pool = Pool::new(PoolOptions::new(4, 1, || async { open_thing().await })).await?;
//! let item = pool.get(&cancel).await?;
//! // ... use item ...
//! pool.put(Some(item));
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{PoolError, Result};
use crate::BoxFuture;

/// Something a [`Pool`] can manage.
pub trait Poolable: Send + Sync + 'static {
    /// Release the resource. Must be idempotent.
    fn close(&self);

    /// Whether the resource is unusable.
    fn is_closed(&self) -> bool;

    /// Token cancelled when the resource closes.
    fn close_notify(&self) -> CancellationToken;
}

impl<P: Poolable> Poolable for Arc<P> {
    fn close(&self) {
        P::close(self)
    }

    fn is_closed(&self) -> bool {
        P::is_closed(self)
    }

    fn close_notify(&self) -> CancellationToken {
        P::close_notify(self)
    }
}

/// Async constructor for pool items.
pub type Factory<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Pool construction parameters.
pub struct PoolOptions<T> {
    /// Upper bound on live items.
    pub max_size: usize,
    /// Items created eagerly by [`Pool::new`].
    pub init_size: usize,
    /// Item constructor.
    pub factory: Factory<T>,
}

impl<T> PoolOptions<T> {
    /// Build options from an async closure.
    pub fn new<F, Fut>(max_size: usize, init_size: usize, factory: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            max_size,
            init_size,
            factory: Arc::new(move || -> BoxFuture<'static, Result<T>> { Box::pin(factory()) }),
        }
    }
}

struct State<T> {
    free: VecDeque<T>,
    live: usize,
    closed: bool,
}

struct Shared<T> {
    state: Mutex<State<T>>,
    changed: Notify,
    max_size: usize,
    factory: Factory<T>,
}

impl<T> Shared<T> {
    fn release_slot(&self) {
        let mut state = self.state.lock();
        state.live = state.live.saturating_sub(1);
        drop(state);
        self.changed.notify_waiters();
    }
}

/// Bounded pool of `T`. Cloning shares the same pool.
pub struct Pool<T: Poolable> {
    shared: Arc<Shared<T>>,
}

impl<T: Poolable> Clone for Pool<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

enum Acquire<T> {
    Ready(T),
    Create,
    Wait,
}

impl<T: Poolable> Pool<T> {
    /// Validate `opts` and create `init_size` items.
    ///
    /// # Errors
    ///
    /// [`PoolError::InvalidOptions`] when `max_size == 0` or
    /// `init_size > max_size`; [`PoolError::Factory`] if an eager item
    /// cannot be created (already created items are closed).
    pub async fn new(opts: PoolOptions<T>) -> Result<Self> {
        if opts.max_size == 0 {
            return Err(PoolError::InvalidOptions("max_size must be non-zero".into()).into());
        }
        if opts.init_size > opts.max_size {
            return Err(PoolError::InvalidOptions(format!(
                "init_size {} exceeds max_size {}",
                opts.init_size, opts.max_size
            ))
            .into());
        }

        let pool = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    free: VecDeque::with_capacity(opts.max_size),
                    live: 0,
                    closed: false,
                }),
                changed: Notify::new(),
                max_size: opts.max_size,
                factory: opts.factory,
            }),
        };

        for _ in 0..opts.init_size {
            pool.shared.state.lock().live += 1;
            match pool.create().await {
                Ok(item) => pool.put(Some(item)),
                Err(e) => {
                    pool.close();
                    return Err(e);
                }
            }
        }

        Ok(pool)
    }

    /// Take an item, creating one if below capacity, else wait for one.
    ///
    /// # Errors
    ///
    /// [`PoolError::Closed`] after [`Pool::close`], [`PoolError::Cancelled`]
    /// if `cancel` fires while waiting, [`PoolError::Factory`] if creation
    /// fails.
    pub async fn get(&self, cancel: &CancellationToken) -> Result<T> {
        loop {
            let changed = self.shared.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            match self.try_acquire()? {
                Acquire::Ready(item) => return Ok(item),
                Acquire::Create => return self.create().await,
                Acquire::Wait => {}
            }

            tokio::select! {
                _ = cancel.cancelled() => return Err(PoolError::Cancelled.into()),
                _ = changed.as_mut() => {}
            }
        }
    }

    fn try_acquire(&self) -> std::result::Result<Acquire<T>, PoolError> {
        let mut state = self.shared.state.lock();
        if state.closed {
            return Err(PoolError::Closed);
        }

        while let Some(item) = state.free.pop_front() {
            if !item.is_closed() {
                return Ok(Acquire::Ready(item));
            }
            // Its watcher gives the slot back.
        }

        if state.live < self.shared.max_size {
            state.live += 1;
            return Ok(Acquire::Create);
        }
        Ok(Acquire::Wait)
    }

    /// Run the factory for a slot already counted in `live`.
    async fn create(&self) -> Result<T> {
        let item = match (self.shared.factory)().await {
            Ok(item) => item,
            Err(e) => {
                self.shared.release_slot();
                return Err(PoolError::Factory(Box::new(e)).into());
            }
        };

        let notify = item.close_notify();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            notify.cancelled().await;
            shared.release_slot();
        });

        Ok(item)
    }

    /// Return an item. Never blocks.
    ///
    /// `None` is ignored. The item is closed instead of pooled when it is
    /// already closed, the pool is closed, or the free list is full.
    pub fn put(&self, item: Option<T>) {
        let Some(item) = item else {
            return;
        };
        if item.is_closed() {
            return;
        }

        let mut state = self.shared.state.lock();
        if state.closed || state.free.len() >= self.shared.max_size {
            drop(state);
            item.close();
            return;
        }
        state.free.push_back(item);
        drop(state);
        self.shared.changed.notify_waiters();
    }

    /// Close the pool and every pooled item. Idempotent.
    pub fn close(&self) {
        let items = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            std::mem::take(&mut state.free)
        };

        debug!(items = items.len(), "Pool closing");
        for item in items {
            item.close();
        }
        self.shared.changed.notify_waiters();
    }

    /// Whether [`Pool::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Items counted against `max_size`.
    pub fn live(&self) -> usize {
        self.shared.state.lock().live
    }

    /// Items sitting in the free list.
    pub fn idle(&self) -> usize {
        self.shared.state.lock().free.len()
    }

    /// Configured capacity.
    pub fn max_size(&self) -> usize {
        self.shared.max_size
    }
}

impl<T: Poolable> std::fmt::Debug for Pool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Pool")
            .field("max_size", &self.shared.max_size)
            .field("live", &state.live)
            .field("idle", &state.free.len())
            .field("closed", &state.closed)
            .finish()
    }
}
