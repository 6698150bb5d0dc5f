//! # 静默定时器
//!
//! ## 核心意图（Why）
//! - `stop_chain(name, timeout > 0)` 需要在超时后于独立执行上下文中完成
//!   `QUIESCED → INITIALIZED` 迁移；定时能力通过 [`TimerService`] 注入，框架本身不绑定运行时；
//! - 测试需要确定性的时间轴，[`ManualTimer`] 以显式 `advance` 推进虚拟时间。
//!
//! ## 行为契约（What）
//! - [`TimerService::schedule`] 返回可取消的 [`TimerHandle`]；已取消的任务永不执行；
//! - [`TokioTimer`] 默认惰性创建一个单工作线程的专用 Tokio 运行时，也可接入宿主运行时句柄；
//! - 任务在阻塞线程池中执行，因为静默完成需要获取框架锁并同步派发监听器回调。

use std::io;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Builder, Handle, Runtime};
use tracing::debug;

/// 定时任务。
pub type TimerTask = Box<dyn FnOnce() + Send + 'static>;

/// 可取消的定时任务句柄。
#[derive(Clone, Debug, Default)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
}

impl TimerHandle {
    /// 创建未取消的句柄。
    pub fn new() -> Self {
        Self::default()
    }

    /// 取消任务；任务尚未执行时将不再执行。
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// 是否已取消。
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// 定时服务。
///
/// # 教案式说明
/// - **契约 (What)**：`schedule` 必须立即返回，任务在 `delay` 之后于其他执行上下文中运行；
///   实现需在执行前检查 [`TimerHandle::is_cancelled`]；
/// - **风险 (Trade-offs)**：返回 `io::Result` 以便运行时创建失败时由调用方降级为同步完成。
pub trait TimerService: Send + Sync {
    /// 在 `delay` 之后执行任务。
    fn schedule(&self, delay: Duration, task: TimerTask) -> io::Result<TimerHandle>;

    /// 停止服务，丢弃尚未执行的任务。
    fn shutdown(&self) {}
}

/// 基于 Tokio 的定时服务。
pub struct TokioTimer {
    handle: Option<Handle>,
    runtime: OnceLock<Runtime>,
    shut_down: AtomicBool,
}

impl TokioTimer {
    /// 创建使用专用运行时的定时器；运行时在首次调度时创建。
    pub fn new() -> Self {
        Self {
            handle: None,
            runtime: OnceLock::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// 接入宿主提供的运行时。
    pub fn with_handle(handle: Handle) -> Self {
        Self {
            handle: Some(handle),
            runtime: OnceLock::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    fn handle(&self) -> io::Result<Handle> {
        if let Some(handle) = &self.handle {
            return Ok(handle.clone());
        }
        if let Some(runtime) = self.runtime.get() {
            return Ok(runtime.handle().clone());
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("channelfw-quiesce")
            .enable_time()
            .build()?;
        // 并发初始化时落败的一方直接丢弃自己创建的运行时。
        let _ = self.runtime.set(runtime);
        match self.runtime.get() {
            Some(runtime) => Ok(runtime.handle().clone()),
            None => Err(io::Error::other("quiesce runtime unavailable")),
        }
    }
}

impl Default for TokioTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TimerService for TokioTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> io::Result<TimerHandle> {
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(io::Error::other("timer service is shut down"));
        }
        let handle = self.handle()?;
        let timer = TimerHandle::new();
        let guard = timer.clone();
        let spawner = handle.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if guard.is_cancelled() {
                return;
            }
            let _ = spawner.spawn_blocking(move || {
                if !guard.is_cancelled() {
                    task();
                }
            });
        });
        Ok(timer)
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        debug!("quiesce timer service shut down");
    }
}

impl Drop for TokioTimer {
    fn drop(&mut self) {
        // 专用运行时可能在异步上下文中被丢弃，必须以后台方式关闭。
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

struct ManualTask {
    deadline: Duration,
    sequence: u64,
    handle: TimerHandle,
    task: TimerTask,
}

#[derive(Default)]
struct ManualState {
    elapsed: Duration,
    sequence: u64,
    tasks: Vec<ManualTask>,
}

/// 手动推进的定时器。
///
/// # 教案式说明
/// - **意图 (Why)**：在单线程、可控的时间轴下验证静默节律，避免真实计时器带来的非确定性；
/// - **契约 (What)**：`advance` 累加虚拟时间并按截止时间、调度顺序执行到期任务；
/// - **实现 (How)**：先在锁内摘出到期任务，释放锁后逐个执行，任务内部可以再次调度。
#[derive(Clone, Default)]
pub struct ManualTimer {
    state: Arc<Mutex<ManualState>>,
}

impl ManualTimer {
    /// 创建虚拟时间为零的定时器。
    pub fn new() -> Self {
        Self::default()
    }

    /// 推进虚拟时间并执行全部到期任务，返回执行的任务数。
    pub fn advance(&self, delta: Duration) -> usize {
        let due = {
            let mut state = self.state.lock();
            state.elapsed = state.elapsed.saturating_add(delta);
            let now = state.elapsed;
            let (mut due, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut state.tasks)
                .into_iter()
                .partition(|task| task.deadline <= now);
            state.tasks = pending;
            due.sort_by_key(|task| (task.deadline, task.sequence));
            due
        };
        let mut executed = 0;
        for task in due {
            if task.handle.is_cancelled() {
                continue;
            }
            (task.task)();
            executed += 1;
        }
        executed
    }

    /// 已推进的虚拟时间。
    pub fn elapsed(&self) -> Duration {
        self.state.lock().elapsed
    }

    /// 尚未执行且未取消的任务数。
    pub fn pending(&self) -> usize {
        self.state
            .lock()
            .tasks
            .iter()
            .filter(|task| !task.handle.is_cancelled())
            .count()
    }
}

impl TimerService for ManualTimer {
    fn schedule(&self, delay: Duration, task: TimerTask) -> io::Result<TimerHandle> {
        let mut state = self.state.lock();
        let handle = TimerHandle::new();
        let deadline = state.elapsed.saturating_add(delay);
        let sequence = state.sequence;
        state.sequence += 1;
        state.tasks.push(ManualTask {
            deadline,
            sequence,
            handle: handle.clone(),
            task,
        });
        Ok(handle)
    }

    fn shutdown(&self) {
        self.state.lock().tasks.clear();
    }
}
