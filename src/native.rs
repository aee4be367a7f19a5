// File: src/native.rs
//
// Native functions registered at VM init: `clock`, `sqrt`, `inputLine`.
// Each is allocated once as a `NativeObj` and bound as a global by
// `Vm::new`.

use crate::memory::Heap;
use crate::value::Value;
use std::io::BufRead;
use std::time::Instant;

/// Process start time, used to compute `clock()`'s elapsed seconds. A
/// true CPU-time clock would need platform-specific syscalls the rest of
/// this crate has no other reason to depend on; wall-clock elapsed time
/// since process start is a portable approximation.
static START: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

pub fn clock(_args: &[Value], _heap: &mut Heap) -> Result<Value, String> {
    let start = START.get_or_init(Instant::now);
    Ok(Value::Number(start.elapsed().as_secs_f64()))
}

pub fn sqrt(args: &[Value], _heap: &mut Heap) -> Result<Value, String> {
    let n = args[0].as_number().ok_or_else(|| "sqrt() expects a number.".to_string())?;
    if n < 0.0 {
        return Err("sqrt() domain error: negative argument.".to_string());
    }
    Ok(Value::Number(n.sqrt()))
}

pub fn input_line(_args: &[Value], heap: &mut Heap) -> Result<Value, String> {
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).map_err(|e| format!("inputLine() failed: {e}"))?;
    while line.ends_with('\n') || line.ends_with('\r') {
        line.pop();
    }
    Ok(Value::Obj(heap.intern(line.as_bytes())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqrt_of_perfect_square() {
        let mut heap = Heap::new();
        assert!(matches!(sqrt(&[Value::Number(9.0)], &mut heap), Ok(Value::Number(n)) if n == 3.0));
    }

    #[test]
    fn sqrt_rejects_negative() {
        let mut heap = Heap::new();
        assert!(sqrt(&[Value::Number(-1.0)], &mut heap).is_err());
    }

    #[test]
    fn sqrt_rejects_non_number() {
        let mut heap = Heap::new();
        assert!(sqrt(&[Value::Nil], &mut heap).is_err());
    }

    #[test]
    fn clock_is_non_negative_and_monotonic() {
        let mut heap = Heap::new();
        let a = clock(&[], &mut heap).unwrap().as_number().unwrap();
        let b = clock(&[], &mut heap).unwrap().as_number().unwrap();
        assert!(a >= 0.0);
        assert!(b >= a);
    }
}
