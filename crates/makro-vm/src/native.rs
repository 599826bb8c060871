use crate::value::Value;
use crate::vm::VM;

/// A host function callable from scripts. Natives receive the VM by shared
/// reference, so they cannot allocate.
pub type NativeFn = fn(&VM, &[Value]) -> Value;

/// Natives installed as globals by every new [`VM`].
pub const NATIVES: &[(&str, NativeFn)] = &[("clock", clock)];

/// Seconds elapsed since the VM was created.
pub fn clock(vm: &VM, _args: &[Value]) -> Value {
    Value::Number(vm.start_time().elapsed().as_secs_f64())
}
