// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Property tests for channel ordering.

use proptest::prelude::*;
use tandem_rt::{Runtime, Value};

/// Send `values` from one task, receive them at the root until close.
fn pass_through(rt: &Runtime, capacity: usize, values: Vec<i64>) -> Vec<i64> {
    let ch = rt.channel(capacity);
    let tx = ch.clone();
    let producer = rt.spawn_proc(move |cx| {
        for &v in &values {
            tx.send(cx, Value::Int(v))?;
        }
        cx.run_once(|| tx.close())?;
        Ok(Value::Nil)
    });

    let cx = rt.root_context();
    let mut received = Vec::new();
    loop {
        match ch.receive(&cx).unwrap() {
            Value::Int(n) => received.push(n),
            Value::Nil => break,
            other => panic!("unexpected {:?}", other),
        }
    }
    rt.value(&producer).unwrap();
    received
}

proptest! {
    #[test]
    fn cooperative_channel_is_fifo(
        capacity in 0usize..4,
        values in prop::collection::vec(any::<i64>(), 0..24),
    ) {
        let rt = Runtime::cooperative();
        prop_assert_eq!(pass_through(&rt, capacity, values.clone()), values);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn parallel_channel_is_fifo(
        capacity in 0usize..4,
        values in prop::collection::vec(any::<i64>(), 0..16),
    ) {
        let rt = Runtime::parallel();
        prop_assert_eq!(pass_through(&rt, capacity, values.clone()), values);
    }
}
