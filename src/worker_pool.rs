//! Bounded fan-out/fan-in over scoped worker threads.

use std::collections::VecDeque;
use std::sync::{mpsc, Mutex};
use std::thread;

/// Runs `work` over `items` on at most `degree` threads.
///
/// `on_result` runs on the calling thread, once per item, in completion order,
/// with the item's original index. Returns after every item has completed.
pub fn run_bounded<T, R, W, C>(items: Vec<T>, degree: usize, work: W, mut on_result: C)
where
    T: Send,
    R: Send,
    W: Fn(T) -> R + Sync,
    C: FnMut(usize, R),
{
    if items.is_empty() {
        return;
    }
    let worker_count = degree.clamp(1, items.len());
    let queue: Mutex<VecDeque<(usize, T)>> = Mutex::new(items.into_iter().enumerate().collect());
    let (result_sender, result_receiver) = mpsc::channel::<(usize, R)>();

    thread::scope(|scope| {
        for _ in 0..worker_count {
            let sender = result_sender.clone();
            let queue = &queue;
            let work = &work;
            scope.spawn(move || loop {
                let next = queue.lock().expect("work queue lock poisoned").pop_front();
                let Some((index, item)) = next else {
                    break;
                };
                if sender.send((index, work(item))).is_err() {
                    break;
                }
            });
        }
        drop(result_sender);

        for (index, result) in result_receiver {
            on_result(index, result);
        }
    });
}

/// Like [`run_bounded`], but collects results back into input order.
pub fn map_bounded<T, R, W>(items: Vec<T>, degree: usize, work: W) -> Vec<R>
where
    T: Send,
    R: Send,
    W: Fn(T) -> R + Sync,
{
    let mut slots: Vec<Option<R>> = std::iter::repeat_with(|| None).take(items.len()).collect();
    run_bounded(items, degree, work, |index, result| slots[index] = Some(result));
    slots.into_iter().flatten().collect()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::{map_bounded, run_bounded};

    #[test]
    fn test_map_bounded_preserves_input_order() {
        let doubled = map_bounded((0..20).collect(), 4, |value: u32| {
            std::thread::sleep(Duration::from_millis(u64::from(20 - value)));
            value * 2
        });
        assert_eq!(doubled, (0..20).map(|value| value * 2).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_bounded_never_exceeds_degree() {
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let mut seen = Vec::new();

        run_bounded(
            (0..12).collect::<Vec<usize>>(),
            3,
            |value| {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(5));
                active.fetch_sub(1, Ordering::SeqCst);
                value
            },
            |index, value| {
                assert_eq!(index, value);
                seen.push(value);
            },
        );

        assert!(peak.load(Ordering::SeqCst) <= 3);
        seen.sort_unstable();
        assert_eq!(seen, (0..12).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_bounded_with_no_items_does_nothing() {
        let mut calls = 0;
        run_bounded(Vec::<u8>::new(), 4, |value| value, |_, _| calls += 1);
        assert_eq!(calls, 0);
    }
}
