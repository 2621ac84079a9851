use crate::object::ObjRef;

#[derive(Copy, Clone, Debug, PartialEq)]
pub enum Value {
    Number(f64),
    Object(ObjRef),
    Boolean(bool),
    Null,
}

impl Value {
    pub fn is_falsey(self) -> bool {
        !bool::from(self)
    }

    pub fn as_object(self) -> Option<ObjRef> {
        match self {
            Self::Object(r) => Some(r),
            _ => None,
        }
    }
}

impl From<&Value> for bool {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => false,
            Value::Boolean(b) => *b,
            _ => true,
        }
    }
}

impl From<Value> for bool {
    fn from(value: Value) -> Self {
        bool::from(&value)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Self::Number(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Boolean(b)
    }
}

impl From<ObjRef> for Value {
    fn from(r: ObjRef) -> Self {
        Self::Object(r)
    }
}

pub fn format_number(n: f64) -> String {
    n.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truthiness() {
        assert!(Value::Null.is_falsey());
        assert!(Value::Boolean(false).is_falsey());
        assert!(!Value::Number(0.0).is_falsey());
        assert!(!Value::Boolean(true).is_falsey());
    }

    #[test]
    fn numbers_print_like_integers_when_integral() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(-7.0), "-7");
    }
}
