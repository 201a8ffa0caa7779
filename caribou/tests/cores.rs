use std::{thread, time::Duration};

use bytecode::assemble;
use caribou::{Exported, Mailbox, MachineCreateInfo, cores};

const TRIANGLE: &str = "
    .int 0
    .int 1
        pop r5          ; n
        loadi r3, #0
        loadi r6, #0
        loadi r4, #1
    top:
        add r3, r3, r4
        add r6, r6, r3
        lt r7, r3, r5
        jmp top
        move r2, r6
        halt
";

#[test]
fn blocked_recipient_drains_then_sees_the_deliverer_go() {
    let (deliverer, recipient) = Mailbox::new(4).split();
    let consumer = thread::spawn(move || {
        let mut received = Vec::new();
        while let Some(item) = recipient.receive_blocking() {
            received.push(item);
        }
        received
    });

    // let the consumer block on the empty mailbox first
    thread::sleep(Duration::from_millis(20));
    deliverer.deliver("first").unwrap();
    deliverer.deliver("second").unwrap();
    drop(deliverer);
    assert_eq!(consumer.join().unwrap(), vec!["first", "second"]);
}

#[test]
fn cores_run_in_parallel() {
    let image = assemble(TRIANGLE).unwrap();
    let limits = [10i64, 100, 1_000, 5_000];

    let handles: Vec<_> = limits
        .iter()
        .map(|&n| {
            let core = cores::spawn(
                &format!("triangle-{n}"),
                image.clone(),
                MachineCreateInfo::default(),
            )
            .unwrap();
            core.argument(Exported::Integer(n)).unwrap();
            core.start().unwrap();
            core
        })
        .collect();

    for (handle, n) in handles.into_iter().zip(limits) {
        assert_eq!(handle.name(), format!("triangle-{n}"));
        assert_eq!(handle.join().unwrap(), Exported::Integer(n * (n + 1) / 2));
    }
}

#[test]
fn core_builds_strings_from_its_argument() {
    let image = assemble(
        r#"
        .str "hello, "
        .int 2
            pop r3
            loadi r4, #0
            push r4
            push r3
            loadi r5, #1
            string r5
            pop r2
            halt
        "#,
    )
    .unwrap();

    let core = cores::spawn("greeter", image, MachineCreateInfo::default()).unwrap();
    core.argument(Exported::String("world".into())).unwrap();
    core.start().unwrap();
    assert_eq!(core.join().unwrap(), Exported::String("hello, world".into()));
}
