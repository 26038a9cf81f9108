use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_utils::thread::scope;

use mcas::{
    BackoffStack, EliminationStack, FlatCombiningStack, Stack, ThreadIdPool, TreiberStack,
};

#[cfg(miri)]
const COUNT: usize = 50;
#[cfg(not(miri))]
const COUNT: usize = 10_000;

fn sequential<S: Stack<String>>(stack: &S) {
    assert_eq!(stack.peek(), None);
    assert_eq!(stack.pop(), None);

    stack.push("1".to_string());
    stack.push("2".to_string());
    stack.push("3".to_string());

    assert_eq!(stack.peek().as_deref(), Some("3"));
    assert_eq!(stack.pop().as_deref(), Some("3"));
    assert_eq!(stack.peek().as_deref(), Some("2"));
    assert_eq!(stack.pop().as_deref(), Some("2"));
    assert_eq!(stack.peek().as_deref(), Some("1"));
    assert_eq!(stack.pop().as_deref(), Some("1"));
    assert_eq!(stack.peek(), None);
    assert_eq!(stack.pop(), None);
}

fn lifo_per_thread<S: Stack<usize>>(stack: &S) {
    for i in 0..100 {
        stack.push(i);
    }
    for i in (0..100).rev() {
        assert_eq!(stack.pop(), Some(i));
    }
    assert_eq!(stack.pop(), None);
}

/// One producer, one consumer: the popped multiset must equal the pushed
/// one.
fn conservation<S: Stack<usize> + Sync>(stack: &S) {
    let done = AtomicBool::new(false);
    let mut popped = Vec::with_capacity(COUNT);

    scope(|scope| {
        let done = &done;
        scope.spawn(move |_| {
            for i in 0..COUNT {
                stack.push(i);
            }
            done.store(true, Ordering::Release);
        });

        let popped = &mut popped;
        scope.spawn(move |_| loop {
            match stack.pop() {
                Some(v) => popped.push(v),
                None => {
                    if done.load(Ordering::Acquire) && popped.len() == COUNT {
                        break;
                    }
                }
            }
        });
    })
    .unwrap();

    let unique: HashSet<usize> = popped.iter().copied().collect();
    assert_eq!(popped.len(), COUNT);
    assert_eq!(unique.len(), COUNT);
    assert!(unique.iter().all(|&v| v < COUNT));
}

/// Several threads pushing and popping; nothing may be lost or invented.
fn stress<S: Stack<usize> + Sync>(stack: &S, threads: usize) {
    let per_thread = COUNT / threads;
    let popped = std::sync::Mutex::new(Vec::new());

    scope(|scope| {
        for t in 0..threads {
            let popped = &popped;
            scope.spawn(move |_| {
                let mut mine = Vec::new();
                for i in 0..per_thread {
                    stack.push(t * per_thread + i);
                    if i % 2 == 0 {
                        if let Some(v) = stack.pop() {
                            mine.push(v);
                        }
                    }
                }
                popped.lock().unwrap().extend(mine);
            });
        }
    })
    .unwrap();

    let mut all = popped.into_inner().unwrap();
    while let Some(v) = stack.pop() {
        all.push(v);
    }
    all.sort_unstable();
    let expected: Vec<usize> = (0..threads * per_thread).collect();
    assert_eq!(all, expected);
}

mod treiber {
    use super::*;

    #[test]
    fn sequential() {
        super::sequential(&TreiberStack::new());
    }

    #[test]
    fn lifo_per_thread() {
        super::lifo_per_thread(&TreiberStack::new());
    }

    #[test]
    fn conservation() {
        super::conservation(&TreiberStack::new());
    }

    #[test]
    fn stress() {
        super::stress(&TreiberStack::new(), 4);
    }
}

mod backoff {
    use super::*;

    #[test]
    fn sequential() {
        super::sequential(&BackoffStack::new());
    }

    #[test]
    fn lifo_per_thread() {
        super::lifo_per_thread(&BackoffStack::new());
    }

    #[test]
    fn conservation() {
        super::conservation(&BackoffStack::with_backoff(1, 8));
    }

    #[test]
    fn stress() {
        super::stress(&BackoffStack::new(), 4);
    }
}

mod flat_combining {
    use super::*;

    #[test]
    fn sequential() {
        super::sequential(&FlatCombiningStack::new());
    }

    #[test]
    fn lifo_per_thread() {
        super::lifo_per_thread(&FlatCombiningStack::new());
    }

    #[test]
    fn conservation() {
        super::conservation(&FlatCombiningStack::new());
    }

    #[test]
    fn stress() {
        super::stress(&FlatCombiningStack::with_rounds(5), 4);
    }
}

mod elimination {
    use super::*;

    fn stack() -> EliminationStack<usize> {
        // Enough ids for every test thread, however few processors the
        // machine has.
        EliminationStack::with_thread_ids(Arc::new(ThreadIdPool::new(8)))
    }

    #[test]
    fn sequential() {
        let stack: EliminationStack<String> =
            EliminationStack::with_thread_ids(Arc::new(ThreadIdPool::new(8)));
        super::sequential(&stack);
    }

    #[test]
    fn lifo_per_thread() {
        super::lifo_per_thread(&stack());
    }

    #[test]
    fn conservation() {
        super::conservation(&stack());
    }

    #[test]
    fn stress() {
        super::stress(&stack(), 4);
    }
}
