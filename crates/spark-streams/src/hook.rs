//! 用户钩子的调用约定。
//!
//! 钩子以 `&mut self` 调用，所有者是 `Rc<RefCell<_>>`；重入同一钩子对象会得到
//! [`StreamError::InvalidState`] 而不是 panic。

use std::cell::RefCell;
use std::rc::Rc;

use futures::FutureExt;

use crate::Completion;
use crate::error::StreamError;

/// 已成功的完成。
pub(crate) fn ready_ok() -> Completion {
    futures::future::ready(Ok(())).boxed_local()
}

/// 立即以 `error` 失败的完成。
pub(crate) fn ready_err(error: StreamError) -> Completion {
    futures::future::ready(Err(error)).boxed_local()
}

/// 借出钩子对象并执行一次调用，钩子的同步部分在此刻运行。
pub(crate) fn invoke_hook<S, F>(target: &Rc<RefCell<S>>, call: F) -> Completion
where
    S: ?Sized,
    F: FnOnce(&mut S) -> Completion,
{
    match target.try_borrow_mut() {
        Ok(mut hooks) => call(&mut *hooks),
        Err(_) => ready_err(StreamError::invalid_state(
            "underlying hooks were re-entered",
        )),
    }
}
