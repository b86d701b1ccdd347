//! 单线程协作式调度器。
//!
//! # 设计背景（Why）
//! - 流引擎的全部状态都在单线程内以 `Rc<RefCell<_>>` 共享，用户钩子返回的异步完成需要一个
//!   “当前线程”的调度器来驱动后续的状态迁移；
//! - 直接复用 `futures::executor::LocalPool`，避免引入多线程运行时，也无需 `Send` 约束。
//!
//! # 契约说明（What）
//! - [`spawn_local`] 只负责排队，任务在下一次 [`block_on`] 或 [`run_until_stalled`] 时执行；
//! - 调度器按线程隔离，不同线程之间的流对象互不可见；
//! - [`block_on`] 不可重入：在任务内部再次调用会触发 `RefCell` 借用冲突。
//!
//! # 实现要点（How）
//! - 线程局部变量同时保存 `LocalPool` 与其 `LocalSpawner`，生成器在池被驱动期间仍可用。

mod deferred;

pub use deferred::{Deferred, DeferredFuture};

use std::cell::RefCell;
use std::future::Future;

use futures::executor::{LocalPool, LocalSpawner};
use futures::task::LocalSpawnExt;

struct Scheduler {
    pool: RefCell<LocalPool>,
    spawner: LocalSpawner,
}

thread_local! {
    static SCHEDULER: Scheduler = {
        let pool = LocalPool::new();
        let spawner = pool.spawner();
        Scheduler {
            pool: RefCell::new(pool),
            spawner,
        }
    };
}

/// 在当前线程排队一个后续任务。
pub fn spawn_local<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    SCHEDULER.with(|scheduler| {
        if let Err(err) = scheduler.spawner.spawn_local(future) {
            tracing::warn!(error = %err, "failed to schedule stream continuation");
        }
    });
}

/// 驱动当前线程的调度器直到 `future` 完成。
///
/// 期间所有通过 [`spawn_local`] 排队的任务都会被并发推进。
pub fn block_on<F: Future>(future: F) -> F::Output {
    SCHEDULER.with(|scheduler| scheduler.pool.borrow_mut().run_until(future))
}

/// 执行所有已就绪的任务，直到没有任务能继续推进为止。
pub fn run_until_stalled() {
    SCHEDULER.with(|scheduler| scheduler.pool.borrow_mut().run_until_stalled());
}
