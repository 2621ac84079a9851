//! Subscript, slice and subscript-assignment for strings, lists and maps

use crate::{
    error::{ErrorMsg, RuntimeError},
    object::Object,
    value::Value,
    vm::Vm,
};

impl Vm {
    /// Converts an index operand to an integer
    fn integer(&self, value: Value) -> Result<i64, RuntimeError> {
        match value {
            Value::Number(n) if n.is_finite() && n.fract() == 0.0 => Ok(n as i64),
            _ => Err(self.error(ErrorMsg::IndexNotInteger)),
        }
    }

    fn position(&self, index: Value, len: usize, msg: ErrorMsg) -> Result<usize, RuntimeError> {
        let index = self.integer(index)?;
        usize::try_from(index)
            .ok()
            .filter(|&i| i < len)
            .ok_or_else(|| self.error(msg))
    }

    /// `target[index]`, with both operands on the stack
    pub(crate) fn index(&mut self) -> Result<(), RuntimeError> {
        let (target, index) = (self.peek(1), self.peek(0));
        let result = match self.object(target) {
            Some(Object::Str(s)) => {
                let len = s.chars.chars().count();
                let i = self.position(index, len, ErrorMsg::StringIndexOutOfRange)?;
                let c = s.chars.chars().nth(i).unwrap_or_default().to_string();
                Value::Object(self.intern(&c))
            }
            Some(Object::List(items)) => {
                let i = self.position(index, items.len(), ErrorMsg::ListIndexOutOfRange)?;
                items[i]
            }
            Some(Object::Map(map)) => {
                let key = self.map_key(index)?;
                *map.get(&key).ok_or_else(|| self.error(ErrorMsg::MissingKey))?
            }
            _ => return Err(self.error(ErrorMsg::NotIndexable)),
        };
        self.pop();
        self.pop();
        self.push(result);
        Ok(())
    }

    /// `target[start:end]`. The end is clamped to the length, the start is not.
    pub(crate) fn slice(&mut self) -> Result<(), RuntimeError> {
        let (target, start, end) = (self.peek(2), self.peek(1), self.peek(0));
        let len = match self.object(target) {
            Some(Object::Str(s)) => s.chars.chars().count(),
            Some(Object::List(items)) => items.len(),
            Some(Object::Map(_)) => return Err(self.error(ErrorMsg::MapSlice)),
            _ => return Err(self.error(ErrorMsg::NotIndexable)),
        };
        let (start, end) = (self.integer(start)?, self.integer(end)?);
        if start < 0 || start as usize > len || end < start {
            return Err(self.error(ErrorMsg::SliceOutOfRange));
        }
        let (start, end) = (start as usize, (end as usize).min(len));

        let result = match self.object(target) {
            Some(Object::Str(s)) => {
                let sub: String = s.chars.chars().skip(start).take(end - start).collect();
                self.intern(&sub)
            }
            Some(Object::List(items)) => {
                let sub = items[start..end].to_vec();
                self.alloc(Object::List(sub))
            }
            _ => unreachable!("slice target checked above"),
        };
        self.pop();
        self.pop();
        self.pop();
        self.push(Value::Object(result));
        Ok(())
    }

    /// `target[index] = value`, leaving the value on the stack
    pub(crate) fn set_index(&mut self) -> Result<(), RuntimeError> {
        let (target, index, value) = (self.peek(2), self.peek(1), self.peek(0));
        let Some(r) = target.as_object() else {
            return Err(self.error(ErrorMsg::NotIndexAssignable));
        };
        match &self.heap()[r] {
            Object::List(items) => {
                let i = self.position(index, items.len(), ErrorMsg::ListIndexOutOfRange)?;
                if let Object::List(items) = &mut self.heap_mut()[r] {
                    items[i] = value;
                }
            }
            Object::Map(_) => {
                let key = self.map_key(index)?;
                if let Object::Map(map) = &mut self.heap_mut()[r] {
                    map.insert(key, value);
                }
                self.remeasure(target);
            }
            Object::Str(_) => return Err(self.error(ErrorMsg::ImmutableString)),
            _ => return Err(self.error(ErrorMsg::NotIndexAssignable)),
        }
        self.pop();
        self.pop();
        self.pop();
        self.push(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{error::InterpretError, output::SharedBuffer, vm::Vm};

    fn run_test(source: &str) -> String {
        let out = SharedBuffer::default();
        let mut vm = Vm::default().with_output(out.clone());
        vm.interpret(source).unwrap();
        out.contents()
    }

    fn run_err_test(source: &str) -> String {
        let mut vm = Vm::default().with_output(SharedBuffer::default());
        match vm.interpret(source) {
            Err(InterpretError::Runtime(e)) => e.msg.to_string(),
            other => panic!("expected runtime error, got {other:?}"),
        }
    }

    #[test]
    fn index_strings() {
        assert_eq!(run_test("print \"héllo\"[1];"), "é\n");
        assert_eq!(run_test("print \"abc\"[2] == \"c\";"), "true\n");
        assert_eq!(run_err_test("print \"abc\"[3];"), "String index out of range.");
        assert_eq!(run_err_test("print \"abc\"[-1];"), "String index out of range.");
        assert_eq!(run_err_test("print \"abc\"[0.5];"), "Index must be an integer.");
    }

    #[test]
    fn index_lists_and_maps() {
        assert_eq!(run_test("var l = [1, 2, 3]; print l[0] + l[2];"), "4\n");
        assert_eq!(run_test("var m = {\"a\": 1, 2: \"b\"}; print m[\"a\"]; print m[2];"), "1\nb\n");
        assert_eq!(run_err_test("print [1][1];"), "List index out of range.");
        assert_eq!(run_err_test("print {1: 2}[3];"), "Key not found in map.");
        assert_eq!(run_err_test("print {1: 2}[true];"), "Map keys must be numbers or strings.");
        assert_eq!(run_err_test("print 1[0];"), "Only strings, lists and maps can be indexed.");
    }

    #[test]
    fn negative_zero_key_matches_zero() {
        assert_eq!(run_test("var m = {0: \"zero\"}; print m[-0];"), "zero\n");
    }

    #[test]
    fn slices() {
        assert_eq!(run_test("print \"hello\"[1:3];"), "el\n");
        assert_eq!(run_test("print \"hello\"[2:100];"), "llo\n");
        assert_eq!(run_test("print [1, 2, 3, 4][1:3];"), "[2, 3]\n");
        assert_eq!(run_test("print [1, 2][2:2];"), "[]\n");
        assert_eq!(run_err_test("print [1, 2][3:4];"), "Slice bounds out of range.");
        assert_eq!(run_err_test("print [1, 2][1:0];"), "Slice bounds out of range.");
        assert_eq!(run_err_test("print {1: 2}[0:1];"), "Maps can't be sliced.");
    }

    #[test]
    fn list_slices_are_copies() {
        assert_eq!(run_test("print [10, 20, 30][1] == 20;"), "true\n");
        assert_eq!(
            run_test("var src = [10, 20, 30]; var part = src[0:2]; part[0] = 99; print src; print part;"),
            "[10, 20, 30]\n[99, 20]\n"
        );
    }

    #[test]
    fn index_assignment() {
        assert_eq!(run_test("var l = [1, 2]; l[1] = 5; print l;"), "[1, 5]\n");
        assert_eq!(run_test("var m = {}; print m[\"k\"] = 3; print m[\"k\"];"), "3\n3\n");
        assert_eq!(run_err_test("var s = \"ab\"; s[0] = \"c\";"), "Strings are immutable.");
        assert_eq!(run_err_test("var l = [1]; l[1] = 2;"), "List index out of range.");
        assert_eq!(
            run_err_test("var x = 1; x[0] = 2;"),
            "Only lists and maps support index assignment."
        );
    }
}
