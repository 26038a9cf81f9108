use crossbeam_epoch as epoch;
use crossbeam_utils::thread::scope;

use mcas::{Aref, Casn};

#[test]
fn smoke() {
    let r = Aref::new(42);
    let guard = epoch::pin();

    let v42 = r.load(&guard);
    assert_eq!(v42, Some(&42));
    assert!(r.compare_and_set(v42, Some(43), &guard));
    assert_eq!(r.load(&guard), Some(&43));
    // The old value is stale now.
    assert!(!r.compare_and_set(v42, Some(99), &guard));
    assert_eq!(r.load(&guard), Some(&43));
}

#[test]
fn null_value() {
    let r: Aref<String> = Aref::null();
    let guard = epoch::pin();

    assert_eq!(r.load(&guard), None);
    r.store(None, &guard);
    assert_eq!(r.load(&guard), None);

    assert!(r.compare_and_set(None, None, &guard));
    assert_eq!(r.load(&guard), None);

    assert!(r.compare_and_set(None, Some("null".to_string()), &guard));
    let v = r.load(&guard);
    assert_eq!(v.map(String::as_str), Some("null"));

    assert!(r.compare_and_set(v, None, &guard));
    assert_eq!(r.load(&guard), None);

    r.store(Some("null".to_string()), &guard);
    assert_eq!(r.load(&guard).map(String::as_str), Some("null"));
    r.store(None, &guard);
    assert_eq!(r.load(&guard), None);
}

#[test]
fn cas_chain() {
    let r = Aref::new("uno");
    let guard = epoch::pin();

    assert_eq!(r.load(&guard), Some(&"uno"));
    let uno = r.load(&guard);
    assert!(r.compare_and_set(uno, Some("due"), &guard));
    assert_eq!(r.load(&guard), Some(&"due"));
    assert!(!r.compare_and_set(uno, Some("tre"), &guard));
    assert_eq!(r.load(&guard), Some(&"due"));

    let due = r.load(&guard);
    assert!(r.compare_and_set(due, Some("tre"), &guard));
    let tre = r.load(&guard);
    assert_eq!(tre, Some(&"tre"));
    // Swapping a value for an equal one still succeeds.
    assert!(r.compare_and_set(tre, Some("tre"), &guard));
    assert_eq!(r.load(&guard), Some(&"tre"));
}

#[test]
fn casn_all_or_nothing() {
    let r1 = Aref::new("v1");
    let r2 = Aref::new("v2");
    let r3 = Aref::new("v3");
    let guard = epoch::pin();

    let (v1, v2, v3) = (r1.load(&guard), r2.load(&guard), r3.load(&guard));

    let mut casn = Casn::new();
    casn.compare_exchange(&r1, v1, Some("v1'"));
    casn.compare_exchange(&r2, v2, Some("v2'"));
    casn.compare_exchange(&r3, v3, Some("v3'"));
    assert!(casn.exec(&guard));
    assert_eq!(r1.load(&guard), Some(&"v1'"));
    assert_eq!(r2.load(&guard), Some(&"v2'"));
    assert_eq!(r3.load(&guard), Some(&"v3'"));

    // Same expectations again: every cell is stale, nothing moves.
    let mut stale = Casn::new();
    stale.compare_exchange(&r1, v1, Some("v1'"));
    stale.compare_exchange(&r2, v2, Some("v2'"));
    stale.compare_exchange(&r3, v3, Some("v3'"));
    assert!(!stale.exec(&guard));
    assert_eq!(r1.load(&guard), Some(&"v1'"));
    assert_eq!(r2.load(&guard), Some(&"v2'"));
    assert_eq!(r3.load(&guard), Some(&"v3'"));

    // And back again with fresh expectations.
    let (v1, v2, v3) = (r1.load(&guard), r2.load(&guard), r3.load(&guard));
    let mut back = Casn::new();
    back.compare_exchange(&r1, v1, Some("v1"));
    back.compare_exchange(&r2, v2, Some("v2"));
    back.compare_exchange(&r3, v3, Some("v3"));
    assert!(back.exec(&guard));
    assert_eq!(r1.load(&guard), Some(&"v1"));
    assert_eq!(r2.load(&guard), Some(&"v2"));
    assert_eq!(r3.load(&guard), Some(&"v3"));
}

#[test]
fn casn_partial_failure_leaves_targets_alone() {
    let r1 = Aref::new(1);
    let r2 = Aref::new(2);
    let guard = epoch::pin();

    let v1 = r1.load(&guard);
    let stale = r2.load(&guard);
    r2.store(Some(20), &guard);

    let mut casn = Casn::new();
    casn.compare_exchange(&r1, v1, Some(10));
    casn.compare_exchange(&r2, stale, Some(21));
    assert!(!casn.exec(&guard));

    assert_eq!(r1.load(&guard), Some(&1));
    assert_eq!(r2.load(&guard), Some(&20));
}

#[test]
fn concurrent_casn_is_atomic() {
    #[cfg(miri)]
    const STEPS: usize = 50;
    #[cfg(not(miri))]
    const STEPS: usize = 10_000;

    let r1 = Aref::new(String::new());
    let r2 = Aref::new(String::new());
    let r3 = Aref::new(String::new());

    scope(|scope| {
        for _ in 0..2 {
            scope.spawn(|_| {
                for _ in 0..STEPS {
                    let guard = epoch::pin();
                    let (v1, v2, v3) = (
                        r1.load(&guard),
                        r2.load(&guard),
                        r3.load(&guard),
                    );
                    let mut casn = Casn::new();
                    casn.compare_exchange(&r1, v1, v1.map(|v| format!("{}*", v)));
                    casn.compare_exchange(&r2, v2, v2.map(|v| format!("{}*", v)));
                    casn.compare_exchange(&r3, v3, v3.map(|v| format!("{}*", v)));
                    casn.exec(&guard);
                }
            });
        }
    })
    .unwrap();

    // Every successful transaction grew all three strings together.
    let guard = epoch::pin();
    let n1 = r1.load(&guard).map(String::len);
    let n2 = r2.load(&guard).map(String::len);
    let n3 = r3.load(&guard).map(String::len);
    assert_eq!(n1, n2);
    assert_eq!(n2, n3);
}

#[test]
fn single_cell_casn_equals_cas() {
    let r = Aref::new(5);
    let guard = epoch::pin();

    let v = r.load(&guard);
    let mut casn = Casn::new();
    casn.compare_exchange(&r, v, Some(6));
    assert!(casn.exec(&guard));
    assert_eq!(r.load(&guard), Some(&6));
}

#[test]
fn empty_casn_succeeds() {
    let guard = epoch::pin();
    assert!(Casn::new().exec(&guard));
}
