use std::time::Duration;

use crossbeam_utils::thread::scope;

use mcas::{ExchangeError, Exchanger};

#[test]
fn timeout_without_partner() {
    let ex = Exchanger::new();
    match ex.exchange("hello", Duration::from_millis(1)) {
        Err(ExchangeError::Timeout(v)) => assert_eq!(v, "hello"),
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn closed_exchanger_rejects() {
    let ex = Exchanger::new();
    assert!(!ex.is_closed());
    ex.close();
    assert!(ex.is_closed());
    match ex.exchange("hello", Duration::from_millis(1)) {
        Err(ExchangeError::Closed(v)) => assert_eq!(v, "hello"),
        other => panic!("unexpected: {:?}", other),
    }
}

#[test]
fn close_releases_waiter() {
    let ex = Exchanger::new();
    scope(|scope| {
        let waiter = scope.spawn(|_| ex.exchange(1, Duration::from_secs(30)));
        // Give the waiter a moment to park its offer, then close.
        std::thread::sleep(Duration::from_millis(10));
        ex.close();
        match waiter.join().unwrap() {
            Err(ExchangeError::Closed(v)) => assert_eq!(v, 1),
            // The close raced the offer installation.
            Err(ExchangeError::Timeout(_)) => panic!("waited out the whole timeout"),
            Ok(_) => panic!("exchanged with nobody"),
        }
    })
    .unwrap();
}

#[test]
fn pair_exchanges_values() {
    let ex = Exchanger::new();
    scope(|scope| {
        let a = scope.spawn(|_| ex.exchange("ping", Duration::from_secs(10)));
        let b = scope.spawn(|_| ex.exchange("pong", Duration::from_secs(10)));
        let got_a = a.join().unwrap().unwrap();
        let got_b = b.join().unwrap().unwrap();
        assert_eq!(got_a, "pong");
        assert_eq!(got_b, "ping");
    })
    .unwrap();
}

#[test]
fn hammer_without_deadlock() {
    #[cfg(miri)]
    const STEPS: usize = 100;
    #[cfg(not(miri))]
    const STEPS: usize = 10_000;

    let ex = Exchanger::new();
    scope(|scope| {
        for side in 0..2u32 {
            let ex = &ex;
            scope.spawn(move |_| {
                for n in 0..STEPS as u32 {
                    match ex.exchange((side, n), Duration::from_millis(1)) {
                        // A partner's value always comes from the other
                        // side.
                        Ok((peer, _)) => assert_ne!(peer, side),
                        Err(ExchangeError::Timeout((v, m))) => {
                            assert_eq!((v, m), (side, n));
                        }
                        Err(ExchangeError::Closed(_)) => unreachable!(),
                    }
                }
            });
        }
    })
    .unwrap();
}
