use bytecode::{Image, ImageError, assemble};
use caribou::{
    Exported, Fault, HeapSettings, Machine, MachineCreateInfo, RuntimeError, SlotExistsError,
    Status, Step, Value, VmError,
};

fn int(v: i64) -> Value {
    Value::from_i64(v).unwrap()
}

fn load(source: &str) -> Machine {
    let image = assemble(source).expect("assemble");
    Machine::load(&image, &MachineCreateInfo::default()).expect("load")
}

fn load_small(source: &str, space_size: usize) -> Machine {
    let image = assemble(source).expect("assemble");
    let info = MachineCreateInfo {
        heap: HeapSettings { space_size },
        ..Default::default()
    };
    Machine::load(&image, &info).expect("load")
}

fn run(source: &str) -> Exported {
    let mut machine = load(source);
    let result = machine.run().expect("run");
    machine.export(result).expect("export")
}

#[test]
fn backward_loop_through_fused_compare() {
    let result = run("
        .int 0
        .int 1
        .int 10
            loadi r3, #0
            loadi r4, #1
            loadi r5, #2
        top:
            add r3, r3, r4
            lt r6, r3, r5
            jmp top
            move r2, r3
            halt
    ");
    assert_eq!(result, Exported::Integer(10));
}

#[test]
fn forward_branch_taken_and_skipped() {
    let source = |op: &str, lhs: i64, rhs: i64| {
        format!(
            "
            .int {lhs}
            .int {rhs}
            .int 100
            .int 200
                loadi r3, #0
                loadi r4, #1
                {op} r5, r3, r4
                jmp taken
                loadi r2, #3
                halt
            taken:
                loadi r2, #2
                halt
            "
        )
    };
    // (op, lhs, rhs, taken)
    let cases = [
        ("lt", 2, 5, true),
        ("lt", 5, 2, false),
        ("lt", 5, 5, false),
        ("gt", 5, 2, true),
        ("gt", 2, 5, false),
        ("gt", 5, 5, false),
        ("lte", 2, 5, true),
        ("lte", 5, 5, true),
        ("lte", 5, 2, false),
        ("gte", 5, 2, true),
        ("gte", 5, 5, true),
        ("gte", 2, 5, false),
        ("eq", 5, 5, true),
        ("eq", 2, 5, false),
    ];
    for (op, lhs, rhs, taken) in cases {
        let expected = if taken { 100 } else { 200 };
        assert_eq!(
            run(&source(op, lhs, rhs)),
            Exported::Integer(expected),
            "{op} {lhs} {rhs}"
        );
    }
}

#[test]
fn continuation_round_trip() {
    let mut machine = load("
        .int 1
        .int 2
        .int 3
        .int 4
        .nil
            loadi r3, #0
            push r3
            loadi r3, #1
            push r3
            loadi r3, #2
            push r3
            save r4
        resume:
            loadi r5, #4
            eq r6, r4, r5
            jmp done
            loadi r3, #3
            push r3
            restore r4
        done:
            halt
    ");

    // up to and including SAVE
    for _ in 0..7 {
        assert_eq!(machine.step().unwrap(), Step::Continue);
    }
    let resume_ip = machine.ip();
    let k = machine.register(4).unwrap();
    assert!(k.is_reference());

    // compare, skipped jump, push 4, restore
    for _ in 0..5 {
        machine.step().unwrap();
    }
    assert_eq!(machine.ip(), resume_ip);
    assert_eq!(machine.stack(), &[int(1), int(2), int(3)]);
    assert_eq!(machine.register(4).unwrap(), Value::NIL);

    assert_eq!(machine.run().unwrap(), Value::NIL);
    assert!(matches!(
        machine.restore_continuation(k),
        Err(VmError::Fault(Fault::ContinuationConsumed))
    ));
}

#[test]
fn continuation_survives_collections_driven_by_the_program() {
    let mut machine = load_small(
        "
        .int 1
        .int 2
        .int 0
        .int 1
        .int 200
        .nil
            loadi r3, #0
            push r3
            loadi r3, #1
            push r3
            loadi r5, #1
            array r5
            save r4
            loadi r6, #5
            eq r7, r4, r6
            jmp done
            pop r3          ; the array is now held only by the continuation
            loadi r3, #2
            loadi r5, #3
            loadi r6, #4
            loadi r7, #2
        churn:
            array r7
            pop r2
            add r3, r3, r5
            lt r2, r3, r6
            jmp churn
            restore r4
        done:
            pop r2
            halt
        ",
        1024,
    );
    let result = machine.run().unwrap();
    assert!(machine.stats().collections >= 2);
    assert_eq!(
        machine.export(result).unwrap(),
        Exported::Array(vec![Exported::Integer(1), Exported::Integer(2)])
    );
    assert!(machine.stack().is_empty());
}

#[test]
fn live_set_larger_than_the_heap_faults_for_good() {
    let mut machine = load_small(
        "
        .int 0
            loadi r3, #0
        grow:
            array r3        ; every empty array stays on the stack
            jmp grow
        ",
        1024,
    );
    let err = machine.run().unwrap_err();
    assert!(matches!(err, VmError::Fault(Fault::OutOfMemory { .. })));
    assert!(matches!(machine.status(), Status::Faulted(Fault::OutOfMemory { .. })));
    assert!(machine.heap().used() <= 1024);
    assert!(!machine.stack().is_empty());

    let ip = machine.ip();
    assert!(matches!(
        machine.step(),
        Err(VmError::Fault(Fault::OutOfMemory { .. }))
    ));
    assert_eq!(machine.ip(), ip);
}

/// `down` sends itself `n - 1` until it reaches zero, allocating a message
/// array and a message object per level.
const RECURSIVE_DOWN: &str = "
    .int 0
    .int 1
    .int 2
    .int 60
    .sym down
    .method down 1 1 down_body
    .object down=5
        loadi r3, #6
        loadi r4, #3
        loadi r5, #4
        push r5
        push r4
        loadi r6, #2
        array r6
        pop r7
        send r3, r7, r0
        halt
    down_body:
        loadi r3, #0
        gt r4, r8, r3
        jmp recurse
        push r8
        ret
    recurse:
        loadi r5, #1
        sub r9, r8, r5
        loadi r6, #4
        push r6
        push r9
        loadi r7, #2
        array r7
        pop r7
        send r0, r7, r0
        push r2
        ret
";

#[test]
fn recursive_sends_survive_collections_on_a_small_heap() {
    for space_size in [3000, 3400] {
        let mut machine = load_small(RECURSIVE_DOWN, space_size);
        assert_eq!(machine.run().unwrap(), int(0), "space {space_size}");
        assert!(machine.stats().collections >= 1, "space {space_size}");
        assert!(machine.heap().used() <= space_size);
    }
}

/// `area` churns through garbage before answering its scope.
const SCOPED: &str = "
    .int 7
    .object width=0
    .method area 0 0 area_body #1
    .object area=2
    .sym area
    .int 0
    .int 1
    .int 200
        loadi r3, #3
        loadi r4, #4
        send r3, r4, r0
        halt
    area_body:
        loadi r3, #5
        loadi r5, #6
        loadi r6, #7
        loadi r7, #5
    churn:
        array r7
        pop r4
        add r3, r3, r5
        lt r4, r3, r6
        jmp churn
        push r1
        ret
";

#[test]
fn activations_see_the_method_scope_across_collections() {
    let mut machine = load_small(SCOPED, 1024);
    let result = machine.run().unwrap();
    assert!(machine.stats().collections >= 1);
    assert_eq!(result, machine.constants()[1]);
    assert_eq!(
        machine.export(result).unwrap(),
        Exported::Object(vec![("width".into(), Exported::Integer(7))])
    );

    // a method without a scope sees nil
    let mut machine = load(&SCOPED.replace(" #1\n", "\n"));
    assert_eq!(machine.run().unwrap(), Value::NIL);
}

#[test]
fn objects_reachable_only_from_a_continuation_survive_collection() {
    let mut machine = Machine::new(&MachineCreateInfo {
        heap: HeapSettings { space_size: 1024 },
        ..Default::default()
    });
    let kept = machine.alloc_string("kept").unwrap();
    let array = machine.alloc_array(vec![kept, int(5)]).unwrap();
    machine.push(array).unwrap();
    let k = machine.save_continuation(0, 4).unwrap();
    machine.pop().unwrap();
    machine.set_register(5, k).unwrap();

    for _ in 0..100 {
        machine.alloc_string("garbage garbage garbage").unwrap();
    }
    assert!(machine.stats().collections >= 2);

    let k = machine.register(5).unwrap();
    assert_eq!(k.reference().unwrap().0, machine.heap().active_space());
    machine.restore_continuation(k).unwrap();
    let array = machine.stack()[0];
    assert_eq!(
        machine.export(array).unwrap(),
        Exported::Array(vec![Exported::String("kept".into()), Exported::Integer(5)])
    );
}

#[test]
fn division_by_zero_faults_for_good() {
    let mut machine = load("
        .int 7
        .int 0
            loadi r3, #0
            loadi r4, #1
            div r2, r3, r4
            halt
    ");
    let err = machine.run().unwrap_err();
    assert!(matches!(err, VmError::Fault(Fault::DivisionByZero)));
    assert_eq!(machine.ip(), 8);
    assert_eq!(machine.status(), &Status::Faulted(Fault::DivisionByZero));
    assert!(matches!(
        machine.step(),
        Err(VmError::Fault(Fault::DivisionByZero))
    ));

    let mut machine = load("
        .int 7
        .int 0
            loadi r3, #0
            loadi r4, #1
            mod r2, r3, r4
    ");
    assert!(matches!(
        machine.run(),
        Err(VmError::Fault(Fault::DivisionByZero))
    ));
}

#[test]
fn rotate_reverses_exactly() {
    let mut machine = load("
        .int 1
        .int 2
        .int 3
        .int 4
            loadi r3, #0
            push r3
            loadi r3, #1
            push r3
            loadi r3, #2
            push r3
            loadi r3, #3
            push r3
            rotate r3
            halt
    ");
    machine.run().unwrap();
    assert_eq!(machine.stack(), &[int(4), int(3), int(2), int(1)]);
}

const DOUBLER: &str = "
    .sym double
    .int 21
    .int 2
    .method double 1 0 double_body
    .object double=3
        loadi r3, #4
        loadi r4, #0
        push r4
        loadi r4, #1
        push r4
        loadi r5, #2
        array r5
        pop r6
        send r3, r6, r0
        halt
    double_body:
        add r8, r8, r8
        push r8
        ret
";

#[test]
fn send_activates_a_method_with_arguments() {
    assert_eq!(run(DOUBLER), Exported::Integer(42));
}

#[test]
fn send_falls_back_to_forward() {
    let result = run("
        .sym missing
        .method forward 1 0 forward_body
        .object forward=1
            loadi r3, #2
            loadi r4, #0
            send r3, r4, r0
            halt
        forward_body:
            push r8
            ret
    ");
    assert_eq!(result, Exported::Message {
        selector: "missing".into(),
        arguments: Vec::new(),
    });
}

#[test]
fn does_not_understand() {
    let mut machine = load("
        .sym frob
        .int 1
        .object size=1
            loadi r3, #2
            loadi r4, #0
            send r3, r4, r0
            halt
    ");
    let err = machine.run().unwrap_err();
    let VmError::Runtime(RuntimeError::MessageNotUnderstood { selector, .. }) = err else {
        panic!("expected does-not-understand, got {err:?}");
    };
    assert_eq!(selector, "frob");
    assert_eq!(machine.ip(), 8);
    assert_eq!(machine.status(), &Status::Ready);
}

#[test]
fn methods_are_found_through_traits() {
    let mut machine = load(DOUBLER);
    let receiver = machine.constants()[4];
    let method = machine.lookup_slot(receiver, "double").unwrap().unwrap();

    // move the method from the receiver into a trait
    let behaviour = machine.new_object().unwrap();
    machine.add_slot(behaviour, "double", method).unwrap();
    let receiver = machine.constants()[4];
    machine.remove_slot(receiver, "double").unwrap();
    machine.add_trait(receiver, behaviour).unwrap();

    let result = machine.run().unwrap();
    assert_eq!(result, int(42));
}

#[test]
fn trait_conflict_is_reported_and_leaves_traits_alone() {
    let mut machine = Machine::new(&MachineCreateInfo::default());
    let object = machine.new_object().unwrap();
    machine.push(object).unwrap();
    let first = machine.new_object().unwrap();
    machine.push(first).unwrap();
    machine.add_slot(first, "colour", int(1)).unwrap();
    let second = machine.new_object().unwrap();
    machine.push(second).unwrap();
    machine.add_slot(second, "colour", int(2)).unwrap();

    let [object, first, second] = [machine.stack()[0], machine.stack()[1], machine.stack()[2]];
    machine.add_trait(object, first).unwrap();
    let err = machine.add_trait(object, second).unwrap_err();
    assert!(matches!(
        err,
        VmError::Runtime(RuntimeError::SlotExists(SlotExistsError { ref name, offender, .. }))
            if name == "colour" && offender == first
    ));
    assert_eq!(machine.lookup_slot(object, "colour").unwrap(), Some(int(1)));
    let traits = &machine.heap().get(object).unwrap().as_object().unwrap().traits;
    assert_eq!(traits, &vec![first]);
}

#[test]
fn image_round_trip_and_corruption() {
    let image = assemble(DOUBLER).unwrap();
    let bytes = image.to_bytes().unwrap();
    let reloaded = Image::from_bytes(&bytes).unwrap();
    assert_eq!(reloaded, image);

    let mut machine = Machine::load(&reloaded, &MachineCreateInfo::default()).unwrap();
    assert_eq!(machine.run().unwrap(), int(42));

    let mut corrupted = bytes.clone();
    corrupted[0] ^= 0xff;
    let err = Image::from_bytes(&corrupted).unwrap_err();
    assert!(matches!(err, ImageError::BadMagic(_)));
    assert!(err.to_string().starts_with("invalid file format"));

    let truncated = &bytes[..10];
    assert!(matches!(
        Image::from_bytes(truncated),
        Err(ImageError::Truncated)
    ));
}
