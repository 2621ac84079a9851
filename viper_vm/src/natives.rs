use crate::{object::Object, value::Value, vm::Vm};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn install(vm: &mut Vm) {
    vm.define_native("clock", 0, clock);
    vm.define_native("len", 1, len);
    vm.define_list_method("push", 1, push);
    vm.define_list_method("pop", 1, pop);
}

fn clock(_: &mut Vm, _: &[Value]) -> Result<Value, String> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| e.to_string())?;
    Ok(Value::Number(now.as_secs_f64()))
}

fn len(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let len = match args[0].as_object().map(|r| &vm.heap()[r]) {
        Some(Object::Str(s)) => s.chars.chars().count(),
        Some(Object::List(items)) => items.len(),
        Some(Object::Map(map)) => map.len(),
        _ => return Err("len() expects a string, list or map.".to_string()),
    };
    Ok(Value::Number(len as f64))
}

fn list(vm: &mut Vm, receiver: Value) -> &mut Vec<Value> {
    match vm.object_mut(receiver) {
        Some(Object::List(items)) => items,
        _ => unreachable!("list method called on a non-list"),
    }
}

/// `list.push(value)` appends and returns the list
fn push(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    list(vm, args[0]).push(args[1]);
    vm.remeasure(args[0]);
    Ok(args[0])
}

/// `list.pop(index)` removes and returns the element at `index`
fn pop(vm: &mut Vm, args: &[Value]) -> Result<Value, String> {
    let items = list(vm, args[0]);
    if items.is_empty() {
        return Err("Unable to pop element from empty list.".to_string());
    }
    let Value::Number(index) = args[1] else {
        return Err("Expected argument type Number to pop method.".to_string());
    };
    if index < 0.0 || index.fract() != 0.0 || index as usize >= items.len() {
        return Err("List index out of range.".to_string());
    }
    Ok(items.remove(index as usize))
}
