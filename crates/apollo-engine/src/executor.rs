//! Bounded fan-out over independent blocking tasks.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;

use crate::error_chain_text;

pub type Task<'a, T> = Box<dyn FnOnce() -> anyhow::Result<T> + Send + 'a>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome<T> {
    Completed(T),
    Failed(String),
}

impl<T> TaskOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }
}

/// Runs `tasks` on `min(limit, n)` scoped workers sharing one cursor.
///
/// Output slot `i` always belongs to `tasks[i]`. A task that errors or
/// panics only fails its own slot.
pub fn run_bounded<'a, T: Send>(tasks: Vec<Task<'a, T>>, limit: usize) -> Vec<TaskOutcome<T>> {
    let total = tasks.len();
    if total == 0 {
        return Vec::new();
    }
    let workers = limit.clamp(1, total);
    let queue: Vec<Mutex<Option<Task<'a, T>>>> =
        tasks.into_iter().map(|task| Mutex::new(Some(task))).collect();
    let slots: Vec<Mutex<Option<TaskOutcome<T>>>> = (0..total).map(|_| Mutex::new(None)).collect();
    let cursor = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..workers {
            scope.spawn(|| loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                if index >= total {
                    break;
                }
                let task = queue[index].lock().ok().and_then(|mut slot| slot.take());
                let outcome = match task {
                    Some(task) => run_isolated(task),
                    None => TaskOutcome::Failed("task already claimed".to_string()),
                };
                if let Ok(mut slot) = slots[index].lock() {
                    *slot = Some(outcome);
                }
            });
        }
    });

    slots
        .into_iter()
        .map(|slot| {
            slot.into_inner()
                .ok()
                .flatten()
                .unwrap_or_else(|| TaskOutcome::Failed("task produced no result".to_string()))
        })
        .collect()
}

fn run_isolated<T>(task: Task<'_, T>) -> TaskOutcome<T> {
    match panic::catch_unwind(AssertUnwindSafe(task)) {
        Ok(Ok(value)) => TaskOutcome::Completed(value),
        Ok(Err(err)) => TaskOutcome::Failed(error_chain_text(&err, 512)),
        Err(payload) => {
            let detail = payload
                .downcast_ref::<&str>()
                .map(|text| text.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            TaskOutcome::Failed(format!("task panicked: {detail}"))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use anyhow::bail;

    use super::*;

    fn staggered_tasks(n: usize) -> Vec<Task<'static, usize>> {
        (0..n)
            .map(|i| {
                Box::new(move || -> anyhow::Result<usize> {
                    // Later tasks finish first.
                    thread::sleep(Duration::from_millis(((n - i) * 5) as u64));
                    Ok(i * 10)
                }) as Task<'static, usize>
            })
            .collect()
    }

    #[test]
    fn output_order_matches_input_for_every_limit() {
        let n = 6;
        for limit in 1..=n {
            let outcomes = run_bounded(staggered_tasks(n), limit);
            let expected = (0..n).map(|i| TaskOutcome::Completed(i * 10)).collect::<Vec<_>>();
            assert_eq!(outcomes, expected, "limit {limit}");
        }
    }

    #[test]
    fn failing_task_is_isolated() {
        let tasks: Vec<Task<'static, usize>> = (0..5)
            .map(|i| {
                Box::new(move || -> anyhow::Result<usize> {
                    if i == 2 {
                        bail!("model exploded");
                    }
                    Ok(i)
                }) as Task<'static, usize>
            })
            .collect();
        let outcomes = run_bounded(tasks, 2);
        assert_eq!(outcomes.len(), 5);
        for (i, outcome) in outcomes.iter().enumerate() {
            if i == 2 {
                assert_eq!(outcome, &TaskOutcome::Failed("model exploded".to_string()));
            } else {
                assert_eq!(outcome, &TaskOutcome::Completed(i));
            }
        }
    }

    #[test]
    fn panicking_task_is_isolated() {
        let tasks: Vec<Task<'static, u8>> = vec![
            Box::new(|| -> anyhow::Result<u8> { Ok(1) }),
            Box::new(|| -> anyhow::Result<u8> { panic!("boom") }),
            Box::new(|| -> anyhow::Result<u8> { Ok(3) }),
        ];
        let outcomes = run_bounded(tasks, 3);
        assert_eq!(outcomes[0], TaskOutcome::Completed(1));
        assert!(matches!(&outcomes[1], TaskOutcome::Failed(msg) if msg.contains("boom")));
        assert_eq!(outcomes[2], TaskOutcome::Completed(3));
    }

    #[test]
    fn never_exceeds_limit() {
        let running = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let tasks: Vec<Task<'_, ()>> = (0..8)
            .map(|_| {
                let running = &running;
                let peak = &peak;
                Box::new(move || -> anyhow::Result<()> {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(10));
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }) as Task<'_, ()>
            })
            .collect();
        let outcomes = run_bounded(tasks, 2);
        assert!(outcomes.iter().all(TaskOutcome::is_completed));
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[test]
    fn empty_input_and_zero_limit() {
        assert!(run_bounded(Vec::<Task<'static, ()>>::new(), 4).is_empty());
        let outcomes = run_bounded(staggered_tasks(2), 0);
        assert_eq!(outcomes, vec![TaskOutcome::Completed(0), TaskOutcome::Completed(10)]);
    }
}
