//! One-shot continuations.
//!
//! `SAVE` deep-copies the whole call stack into a heap object; `RESTORE`
//! takes the copy back out, so each continuation resumes at most once. The
//! snapshot lives inside the heap object and is traced like any other
//! field, which keeps it valid across collections.

use crate::{CallStack, Context, Fault, HeapObject, Machine, Value, VmError};

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub frames: Vec<Context>,
    /// Where execution resumes.
    pub ip: usize,
    /// Register of the top frame that reads nil after resumption.
    pub target: u8,
}

impl Snapshot {
    pub fn capture(calls: &CallStack, ip: usize, target: u8) -> Self {
        Self {
            frames: calls.frames().to_vec(),
            ip,
            target,
        }
    }

    pub fn size(&self) -> usize {
        2 * std::mem::size_of::<Value>() + self.frames.iter().map(Context::size).sum::<usize>()
    }

    pub fn visit_values_mut(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for frame in self.frames.iter_mut() {
            frame.visit_values_mut(visitor);
        }
    }
}

impl Machine {
    /// Capture the call stack. Restoring resumes at `resume_ip` with nil in
    /// register `target`.
    pub fn save_continuation(&mut self, resume_ip: usize, target: u8) -> Result<Value, Fault> {
        let snapshot = Snapshot::capture(&self.calls, resume_ip, target);
        self.allocate(HeapObject::Continuation(Some(snapshot)))
    }

    /// Replace the call stack with the one captured in `continuation` and
    /// return the instruction pointer to resume at.
    pub fn restore_continuation(&mut self, continuation: Value) -> Result<usize, VmError> {
        let object = self.heap.get_mut(continuation).map_err(Fault::from)?;
        let HeapObject::Continuation(captured) = object else {
            return Err(Fault::TypeError {
                expected: "continuation",
                got: continuation,
            }
            .into());
        };
        let snapshot = captured.take().ok_or(Fault::ContinuationConsumed)?;
        self.heap.refund(snapshot.size());

        let Snapshot { frames, ip, target } = snapshot;
        self.calls.replace(frames);
        let top = self.calls.current_mut().ok_or(Fault::StackUnderflow)?;
        top.set_register(target, Value::NIL)?;
        log::debug!("restored continuation {continuation:?} at {ip}");
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MachineCreateInfo;

    fn int(v: i64) -> Value {
        Value::from_i64(v).unwrap()
    }

    #[test]
    fn capture_copies_every_frame() {
        let mut machine = Machine::new(&MachineCreateInfo::default());
        machine.push(int(1)).unwrap();
        let snapshot = Snapshot::capture(&machine.calls, 12, 3);
        machine.push(int(2)).unwrap();
        assert_eq!(snapshot.frames.len(), 1);
        assert_eq!(snapshot.frames[0].stack.as_slice(), &[int(1)]);
        assert_eq!(snapshot.ip, 12);
    }

    #[test]
    fn restore_is_one_shot() {
        let mut machine = Machine::new(&MachineCreateInfo::default());
        machine.push(int(1)).unwrap();
        let k = machine.save_continuation(8, 4).unwrap();
        machine.push(int(2)).unwrap();
        machine.set_register(4, int(5)).unwrap();

        assert_eq!(machine.restore_continuation(k).unwrap(), 8);
        assert_eq!(machine.stack(), &[int(1)]);
        assert_eq!(machine.register(4), Ok(Value::NIL));
        // only the consumed shell is left
        assert_eq!(machine.heap().used(), crate::HEADER_SIZE);

        let err = machine.restore_continuation(k).unwrap_err();
        assert!(matches!(err, VmError::Fault(Fault::ContinuationConsumed)));
    }

    #[test]
    fn restore_rejects_other_values() {
        let mut machine = Machine::new(&MachineCreateInfo::default());
        let s = machine.alloc_string("not a continuation").unwrap();
        assert!(matches!(
            machine.restore_continuation(s),
            Err(VmError::Fault(Fault::TypeError { .. }))
        ));
        assert!(matches!(
            machine.restore_continuation(int(1)),
            Err(VmError::Fault(Fault::TypeError { .. }))
        ));
    }
}
