//! Mutating the hub from inside handlers must never skip or double-deliver

use propflow_events::{EventHub, FireMeta, ListenOptions, Subscription};
use propflow_timing::ManualScheduler;
use proptest::prelude::*;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, Copy)]
enum Behaviour {
    Plain,
    DisposeSelf,
    RegisterSibling,
    DisposeNext,
}

fn behaviour() -> impl Strategy<Value = Behaviour> {
    prop_oneof![
        Just(Behaviour::Plain),
        Just(Behaviour::DisposeSelf),
        Just(Behaviour::RegisterSibling),
        Just(Behaviour::DisposeNext),
    ]
}

proptest! {
    #[test]
    fn every_live_listener_receives_each_fire_once(
        behaviours in prop::collection::vec(behaviour(), 1..12),
        fires in 1usize..4,
    ) {
        let scheduler = ManualScheduler::new();
        let hub: EventHub<usize> = EventHub::new(scheduler.shared());
        let hits = Arc::new(Mutex::new(vec![Vec::<usize>::new(); behaviours.len()]));
        let subs: Arc<Mutex<Vec<Subscription<usize>>>> = Arc::new(Mutex::new(Vec::new()));

        for (index, behaviour) in behaviours.iter().copied().enumerate() {
            let hits = hits.clone();
            let subs_ref = subs.clone();
            let hub_ref = hub.clone();
            let sub = hub.on(
                "k",
                move |event, ctx| {
                    hits.lock().unwrap()[index].push(*event);
                    match behaviour {
                        Behaviour::Plain => {}
                        Behaviour::DisposeSelf => ctx.dispose(),
                        Behaviour::RegisterSibling => {
                            hub_ref.on("k", |_e, _c| {}, ListenOptions::default());
                        }
                        Behaviour::DisposeNext => {
                            let next = subs_ref.lock().unwrap().get(index + 1).cloned();
                            if let Some(next) = next {
                                next.dispose();
                            }
                        }
                    }
                },
                ListenOptions::default(),
            );
            subs.lock().unwrap().push(sub);
        }

        for event in 0..fires {
            hub.fire("k", event, FireMeta::default());
        }

        // Replay the expected deliveries independently of the hub.
        let mut alive = vec![true; behaviours.len()];
        let mut expected = vec![Vec::<usize>::new(); behaviours.len()];
        for event in 0..fires {
            let snapshot = alive.clone();
            for index in 0..behaviours.len() {
                if !snapshot[index] || !alive[index] {
                    continue;
                }
                expected[index].push(event);
                match behaviours[index] {
                    Behaviour::DisposeSelf => alive[index] = false,
                    Behaviour::DisposeNext => {
                        if index + 1 < alive.len() {
                            alive[index + 1] = false;
                        }
                    }
                    _ => {}
                }
            }
        }

        prop_assert_eq!(hits.lock().unwrap().clone(), expected);
    }
}

#[test]
fn nested_fire_from_handler_is_delivered_in_order() {
    let scheduler = ManualScheduler::new();
    let hub: EventHub<u32> = EventHub::new(scheduler.shared());
    let log = Arc::new(Mutex::new(Vec::new()));

    {
        let hub_ref = hub.clone();
        let log = log.clone();
        hub.on(
            "outer",
            move |v, _ctx| {
                log.lock().unwrap().push(format!("outer:{v}"));
                hub_ref.fire("inner", v + 1, FireMeta::default());
            },
            ListenOptions::default(),
        );
    }
    {
        let log = log.clone();
        hub.on(
            "inner",
            move |v, ctx| {
                log.lock().unwrap().push(format!("inner:{v}"));
                ctx.dispose();
            },
            ListenOptions::default(),
        );
    }

    hub.fire("outer", 1, FireMeta::default());
    hub.fire("outer", 10, FireMeta::default());

    assert_eq!(
        *log.lock().unwrap(),
        vec!["outer:1", "inner:2", "outer:10"]
    );
    assert_eq!(hub.listener_count("inner"), 0);
    assert_eq!(scheduler.flush(), 0);
}
