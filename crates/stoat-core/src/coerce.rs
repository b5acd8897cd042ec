//! Coercion and comparison semantics
//!
//! The truthiness, numeric-coercion, equality, and relational tables.
//! Everything here is heap-aware (strings and objects live behind
//! handles) but never allocates except [`add`], which may build a
//! concatenated string.

use stoat_gc::Heap;

use crate::context::VmContext;
use crate::error::VmResult;
use crate::object::HeapObject;
use crate::value::Value;

/// Result of ToPrimitive: either an existing primitive value or a string
/// rendered from an object shape.
enum Primitive {
    Val(Value),
    Str(String),
}

/// Cap on nested array rendering, so cyclic arrays terminate.
const MAX_RENDER_DEPTH: u32 = 8;

fn to_primitive(heap: &Heap<HeapObject>, value: Value) -> Primitive {
    let Some(handle) = value.as_reference() else {
        return Primitive::Val(value);
    };
    match heap.get(handle) {
        // Strings are already primitive.
        Some(HeapObject::String(_)) => Primitive::Val(value),
        Some(_) => Primitive::Str(render(heap, value, 0)),
        None => Primitive::Val(Value::undefined()),
    }
}

/// Truthiness table: `""`, `0`, `-0`, `NaN`, `null`, `undefined`, `false`
/// are falsy; every object reference (empty ones included) is truthy.
pub fn to_boolean(heap: &Heap<HeapObject>, value: Value) -> bool {
    if value.is_nullish() {
        return false;
    }
    if let Some(b) = value.as_boolean() {
        return b;
    }
    if let Some(n) = value.as_number() {
        return n != 0.0 && !n.is_nan();
    }
    if let Some(handle) = value.as_reference()
        && let Some(HeapObject::String(s)) = heap.get(handle)
    {
        return !s.is_empty();
    }
    // Objects, functions, symbols
    true
}

/// Numeric-coercion table: undefined is NaN, null is 0, booleans are 0/1,
/// strings parse as numeric literals or yield NaN.
pub fn to_number(heap: &Heap<HeapObject>, value: Value) -> f64 {
    if value.is_undefined() {
        return f64::NAN;
    }
    if value.is_null() {
        return 0.0;
    }
    if let Some(b) = value.as_boolean() {
        return if b { 1.0 } else { 0.0 };
    }
    if let Some(n) = value.as_number() {
        return n;
    }
    if value.is_symbol() {
        return f64::NAN;
    }
    match to_primitive(heap, value) {
        Primitive::Val(v) => {
            if let Some(handle) = v.as_reference()
                && let Some(HeapObject::String(s)) = heap.get(handle)
            {
                parse_number(s.as_str())
            } else if v.is_undefined() {
                f64::NAN
            } else {
                to_number(heap, v)
            }
        }
        Primitive::Str(s) => parse_number(&s),
    }
}

/// Parse a string as a numeric literal the way the language does:
/// surrounding whitespace ignored, empty means zero, hex accepted,
/// anything else is NaN.
fn parse_number(s: &str) -> f64 {
    let trimmed = s.trim();
    if trimmed.is_empty() {
        return 0.0;
    }
    match trimmed {
        "Infinity" | "+Infinity" => return f64::INFINITY,
        "-Infinity" => return f64::NEG_INFINITY,
        _ => {}
    }
    if let Some(hex) = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
    {
        return match u64::from_str_radix(hex, 16) {
            Ok(n) => n as f64,
            Err(_) => f64::NAN,
        };
    }
    trimmed.parse::<f64>().unwrap_or(f64::NAN)
}

/// Render a number the way the language prints it.
pub fn number_to_string(n: f64) -> String {
    if n.is_nan() {
        return "NaN".to_string();
    }
    if n.is_infinite() {
        return if n > 0.0 { "Infinity" } else { "-Infinity" }.to_string();
    }
    if n == 0.0 {
        return "0".to_string();
    }
    if n.fract() == 0.0 && n.abs() < 1e21 {
        let mut buf = itoa::Buffer::new();
        return buf.format(n as i64).to_string();
    }
    let mut buf = ryu::Buffer::new();
    let formatted = buf.format(n);
    // ryu prints integral floats as "1.0"; the fract() check above means
    // we only reach here with a fractional part or very large magnitude.
    formatted.trim_end_matches(".0").to_string()
}

/// Total string rendering; unconvertible shapes fall back to a generic
/// representation rather than panicking.
pub fn to_display_string(heap: &Heap<HeapObject>, value: Value) -> String {
    render(heap, value, 0)
}

fn render(heap: &Heap<HeapObject>, value: Value, depth: u32) -> String {
    if value.is_undefined() {
        return "undefined".to_string();
    }
    if value.is_null() {
        return "null".to_string();
    }
    if let Some(b) = value.as_boolean() {
        return b.to_string();
    }
    if let Some(n) = value.as_number() {
        return number_to_string(n);
    }
    if let Some(id) = value.as_symbol() {
        return format!("Symbol({})", id);
    }
    let Some(handle) = value.as_reference() else {
        return "undefined".to_string();
    };
    match heap.get(handle) {
        Some(HeapObject::String(s)) => s.as_str().to_string(),
        Some(HeapObject::Array(a)) => {
            if depth >= MAX_RENDER_DEPTH {
                return String::new();
            }
            let mut parts = Vec::with_capacity(a.length as usize);
            for index in 0..a.length {
                let element = a.element(index).unwrap_or(Value::undefined());
                if element.is_nullish() {
                    parts.push(String::new());
                } else {
                    parts.push(render(heap, element, depth + 1));
                }
            }
            parts.join(",")
        }
        Some(HeapObject::Function(f)) => format!("function {}() {{ [code] }}", f.name),
        Some(HeapObject::Native(n)) => format!("function {}() {{ [native code] }}", n.name),
        Some(HeapObject::Promise(_)) => "[object Promise]".to_string(),
        Some(HeapObject::Generator(_)) => "[object Generator]".to_string(),
        Some(HeapObject::Object(_)) | Some(HeapObject::Environment(_)) => {
            "[object Object]".to_string()
        }
        None => "undefined".to_string(),
    }
}

/// The `typeof` table, including the historical `typeof null == "object"`.
pub fn type_of(heap: &Heap<HeapObject>, value: Value) -> &'static str {
    if value.is_undefined() {
        return "undefined";
    }
    if value.is_null() {
        return "object";
    }
    if value.is_boolean() {
        return "boolean";
    }
    if value.is_number() {
        return "number";
    }
    if value.is_symbol() {
        return "symbol";
    }
    match value.as_reference().and_then(|h| heap.get(h)) {
        Some(obj) => obj.type_of(),
        None => "undefined",
    }
}

/// Whether the value is a string reference.
pub fn is_string(heap: &Heap<HeapObject>, value: Value) -> bool {
    string_content(heap, value).is_some()
}

/// Whether the value is an object-like reference (anything heap-allocated
/// except strings).
pub fn is_object(heap: &Heap<HeapObject>, value: Value) -> bool {
    value.is_reference() && !is_string(heap, value)
}

fn string_content(heap: &Heap<HeapObject>, value: Value) -> Option<&str> {
    let handle = value.as_reference()?;
    match heap.get(handle) {
        Some(HeapObject::String(s)) => Some(s.as_str()),
        _ => None,
    }
}

/// Strict equality: tag plus value, no coercion. `NaN !== NaN`;
/// `+0 === -0`; strings compare by content; other references by handle.
pub fn strict_equals(heap: &Heap<HeapObject>, lhs: Value, rhs: Value) -> bool {
    // Numbers first: int32 vs float encodings of the same value, NaN,
    // and the two zeros all need value comparison, not bit comparison.
    if let (Some(a), Some(b)) = (lhs.as_number(), rhs.as_number()) {
        return a == b;
    }
    if lhs.is_number() || rhs.is_number() {
        return false;
    }
    if let (Some(a), Some(b)) = (string_content(heap, lhs), string_content(heap, rhs)) {
        return a == b;
    }
    // Null, undefined, booleans, symbols, and non-string references all
    // compare by identity.
    lhs.bits() == rhs.bits()
}

/// Loose equality ladder: `null == undefined` and nothing else;
/// number/string pairs coerce the string to number; booleans coerce to
/// number first; objects go through ToPrimitive against primitives.
pub fn loose_equals(heap: &Heap<HeapObject>, lhs: Value, rhs: Value) -> bool {
    // Same type: strict comparison.
    let lhs_is_string = string_content(heap, lhs).is_some();
    let rhs_is_string = string_content(heap, rhs).is_some();

    if lhs.is_nullish() || rhs.is_nullish() {
        return lhs.is_nullish() && rhs.is_nullish();
    }
    if lhs.is_number() && rhs.is_number() {
        return strict_equals(heap, lhs, rhs);
    }
    if lhs_is_string && rhs_is_string {
        return strict_equals(heap, lhs, rhs);
    }
    if lhs.is_symbol() || rhs.is_symbol() {
        return lhs.bits() == rhs.bits();
    }
    if let Some(b) = lhs.as_boolean() {
        return loose_equals(heap, Value::number(if b { 1.0 } else { 0.0 }), rhs);
    }
    if let Some(b) = rhs.as_boolean() {
        return loose_equals(heap, lhs, Value::number(if b { 1.0 } else { 0.0 }));
    }
    if lhs.is_number() && rhs_is_string {
        return lhs.as_number() == Some(to_number(heap, rhs));
    }
    if lhs_is_string && rhs.is_number() {
        return Some(to_number(heap, lhs)) == rhs.as_number();
    }

    let lhs_is_object = lhs.is_reference() && !lhs_is_string;
    let rhs_is_object = rhs.is_reference() && !rhs_is_string;
    match (lhs_is_object, rhs_is_object) {
        // Two objects: identity.
        (true, true) => lhs.bits() == rhs.bits(),
        // Object against primitive: ToPrimitive (a rendered string for
        // these object shapes), then retry against the primitive.
        (true, false) => loose_equals_rendered(heap, &render(heap, lhs, 0), rhs),
        (false, true) => loose_equals_rendered(heap, &render(heap, rhs, 0), lhs),
        (false, false) => false,
    }
}

/// Compare an object's ToPrimitive string against a primitive value.
fn loose_equals_rendered(heap: &Heap<HeapObject>, rendered: &str, other: Value) -> bool {
    if let Some(s) = string_content(heap, other) {
        return rendered == s;
    }
    if let Some(n) = other.as_number() {
        return parse_number(rendered) == n;
    }
    false
}

/// Abstract relational comparison. `None` means "undefined" (a NaN was
/// involved), which makes every relational operator false.
pub fn compare(heap: &Heap<HeapObject>, lhs: Value, rhs: Value) -> Option<std::cmp::Ordering> {
    let lhs_prim = to_primitive(heap, lhs);
    let rhs_prim = to_primitive(heap, rhs);

    // String/string comparison is lexicographic.
    let lhs_str = match &lhs_prim {
        Primitive::Val(v) => string_content(heap, *v).map(str::to_string),
        Primitive::Str(s) => Some(s.clone()),
    };
    let rhs_str = match &rhs_prim {
        Primitive::Val(v) => string_content(heap, *v).map(str::to_string),
        Primitive::Str(s) => Some(s.clone()),
    };
    if let (Some(a), Some(b)) = (&lhs_str, &rhs_str) {
        return Some(a.as_str().cmp(b.as_str()));
    }

    let a = match lhs_prim {
        Primitive::Val(v) => to_number(heap, v),
        Primitive::Str(s) => parse_number(&s),
    };
    let b = match rhs_prim {
        Primitive::Val(v) => to_number(heap, v),
        Primitive::Str(s) => parse_number(&s),
    };
    a.partial_cmp(&b)
}

/// The `+` operator: concatenation when either primitive operand is a
/// string, numeric addition otherwise.
pub fn add(ctx: &mut VmContext, lhs: Value, rhs: Value) -> VmResult<Value> {
    let lhs_prim = to_primitive(&ctx.heap, lhs);
    let rhs_prim = to_primitive(&ctx.heap, rhs);

    let prim_is_string = |p: &Primitive, ctx: &VmContext| match p {
        Primitive::Val(v) => string_content(&ctx.heap, *v).is_some(),
        Primitive::Str(_) => true,
    };

    if prim_is_string(&lhs_prim, ctx) || prim_is_string(&rhs_prim, ctx) {
        let render_prim = |p: Primitive, ctx: &VmContext| match p {
            Primitive::Val(v) => to_display_string(&ctx.heap, v),
            Primitive::Str(s) => s,
        };
        let mut out = render_prim(lhs_prim, ctx);
        out.push_str(&render_prim(rhs_prim, ctx));
        return ctx.alloc_string(out);
    }

    let number_prim = |p: Primitive, ctx: &VmContext| match p {
        Primitive::Val(v) => to_number(&ctx.heap, v),
        Primitive::Str(s) => parse_number(&s),
    };
    let a = number_prim(lhs_prim, ctx);
    let b = number_prim(rhs_prim, ctx);
    Ok(Value::number(a + b))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heap() -> Heap<HeapObject> {
        Heap::new()
    }

    fn alloc_str(heap: &mut Heap<HeapObject>, s: &str) -> Value {
        Value::reference(
            heap.alloc(HeapObject::String(crate::object::JsString::new(s)))
                .unwrap(),
        )
    }

    #[test]
    fn truthiness_table() {
        let mut h = heap();
        let empty = alloc_str(&mut h, "");
        let full = alloc_str(&mut h, "x");
        let obj = Value::reference(
            h.alloc(HeapObject::Object(crate::object::JsObject::new()))
                .unwrap(),
        );

        assert!(!to_boolean(&h, Value::undefined()));
        assert!(!to_boolean(&h, Value::null()));
        assert!(!to_boolean(&h, Value::boolean(false)));
        assert!(!to_boolean(&h, Value::number(0.0)));
        assert!(!to_boolean(&h, Value::number(-0.0)));
        assert!(!to_boolean(&h, Value::number(f64::NAN)));
        assert!(!to_boolean(&h, empty));

        assert!(to_boolean(&h, Value::boolean(true)));
        assert!(to_boolean(&h, Value::number(0.5)));
        assert!(to_boolean(&h, full));
        // Empty objects are truthy.
        assert!(to_boolean(&h, obj));
    }

    #[test]
    fn numeric_coercion_table() {
        let mut h = heap();
        assert!(to_number(&h, Value::undefined()).is_nan());
        assert_eq!(to_number(&h, Value::null()), 0.0);
        assert_eq!(to_number(&h, Value::boolean(true)), 1.0);
        assert_eq!(to_number(&h, Value::boolean(false)), 0.0);

        let s = alloc_str(&mut h, " 42 ");
        assert_eq!(to_number(&h, s), 42.0);
        let s = alloc_str(&mut h, "");
        assert_eq!(to_number(&h, s), 0.0);
        let s = alloc_str(&mut h, "0x10");
        assert_eq!(to_number(&h, s), 16.0);
        let s = alloc_str(&mut h, "-Infinity");
        assert_eq!(to_number(&h, s), f64::NEG_INFINITY);
        let s = alloc_str(&mut h, "not a number");
        assert!(to_number(&h, s).is_nan());
    }

    #[test]
    fn number_rendering() {
        assert_eq!(number_to_string(3.0), "3");
        assert_eq!(number_to_string(-0.0), "0");
        assert_eq!(number_to_string(1.5), "1.5");
        assert_eq!(number_to_string(f64::NAN), "NaN");
        assert_eq!(number_to_string(f64::INFINITY), "Infinity");
    }

    #[test]
    fn strict_equality_rules() {
        let mut h = heap();
        // NaN !== NaN
        let nan = Value::number(f64::NAN);
        assert!(!strict_equals(&h, nan, nan));
        // +0 === -0
        assert!(strict_equals(&h, Value::number(0.0), Value::number(-0.0)));
        // int32 and float encodings of the same number are equal
        assert!(strict_equals(&h, Value::int32(3), Value::number(3.0)));
        // null !== undefined
        assert!(!strict_equals(&h, Value::null(), Value::undefined()));
        // strings compare by content across distinct handles
        let a = alloc_str(&mut h, "abc");
        let b = alloc_str(&mut h, "abc");
        assert_ne!(a.bits(), b.bits());
        assert!(strict_equals(&h, a, b));
        // no coercion across types
        let one_str = alloc_str(&mut h, "1");
        assert!(!strict_equals(&h, Value::int32(1), one_str));
    }

    #[test]
    fn loose_equality_ladder() {
        let mut h = heap();
        // null == undefined, and nothing else
        assert!(loose_equals(&h, Value::null(), Value::undefined()));
        assert!(!loose_equals(&h, Value::null(), Value::number(0.0)));
        assert!(!loose_equals(&h, Value::undefined(), Value::boolean(false)));
        // number/string coerces the string
        let one = alloc_str(&mut h, "1");
        assert!(loose_equals(&h, Value::int32(1), one));
        assert!(loose_equals(&h, one, Value::int32(1)));
        // boolean coerces to number first
        assert!(loose_equals(&h, Value::boolean(true), Value::int32(1)));
        let empty = alloc_str(&mut h, "");
        assert!(loose_equals(&h, Value::boolean(false), empty));
        // object identity
        let o1 = Value::reference(
            h.alloc(HeapObject::Object(crate::object::JsObject::new()))
                .unwrap(),
        );
        let o2 = Value::reference(
            h.alloc(HeapObject::Object(crate::object::JsObject::new()))
                .unwrap(),
        );
        assert!(loose_equals(&h, o1, o1));
        assert!(!loose_equals(&h, o1, o2));
    }

    #[test]
    fn relational_comparison() {
        let mut h = heap();
        use std::cmp::Ordering;
        assert_eq!(
            compare(&h, Value::int32(1), Value::int32(2)),
            Some(Ordering::Less)
        );
        // NaN involvement is "undefined"
        assert_eq!(compare(&h, Value::number(f64::NAN), Value::int32(1)), None);
        // String/string is lexicographic
        let a = alloc_str(&mut h, "apple");
        let b = alloc_str(&mut h, "banana");
        assert_eq!(compare(&h, a, b), Some(Ordering::Less));
        // "10" < "9" lexicographically
        let ten = alloc_str(&mut h, "10");
        let nine = alloc_str(&mut h, "9");
        assert_eq!(compare(&h, ten, nine), Some(Ordering::Less));
        // number/string is numeric
        assert_eq!(compare(&h, Value::int32(10), nine), Some(Ordering::Greater));
    }
}
