//! Allow-listed module surface exposed to guest code.
//!
//! Each module is a small shim over the host: `math`, `random`, `time`,
//! `datetime`, and `asyncio` expose the practical slice of their stdlib
//! namesakes; `typing` and `dataclasses` import as inert namespaces so
//! type-annotated programs load without complaint.

use chrono::{Local, Utc};

use super::value::Value;
use super::SandboxError;

/// Default module allow-list.
pub const DEFAULT_ALLOWED_MODULES: &[&str] = &[
    "asyncio",
    "math",
    "random",
    "time",
    "typing",
    "datetime",
    "dataclasses",
];

/// Resolve an attribute on a module namespace.
///
/// Functions come back as [`Value::ModuleFn`]; constants as plain values.
pub fn module_attr(module: &str, path: &str) -> Result<Value, SandboxError> {
    match (module, path) {
        ("math", "pi") => Ok(Value::Float(std::f64::consts::PI)),
        ("math", "e") => Ok(Value::Float(std::f64::consts::E)),
        ("math", "tau") => Ok(Value::Float(std::f64::consts::TAU)),
        ("math", "inf") => Ok(Value::Float(f64::INFINITY)),
        (
            "math",
            "sqrt" | "floor" | "ceil" | "sin" | "cos" | "tan" | "log" | "log10" | "exp"
            | "pow" | "fabs" | "factorial",
        )
        | ("random", "random" | "randint" | "uniform" | "choice" | "shuffle")
        | ("time", "time" | "sleep" | "perf_counter" | "monotonic")
        | ("asyncio", "sleep")
        | ("datetime", "datetime" | "date" | "timezone")
        | ("datetime", "datetime.now" | "datetime.utcnow" | "date.today") => {
            Ok(Value::ModuleFn {
                module: module.to_string(),
                path: path.to_string(),
            })
        }
        ("typing" | "dataclasses", _) => {
            // Inert: annotations evaluate to None and are ignored.
            Ok(Value::None)
        }
        _ => Err(SandboxError::Runtime(format!(
            "AttributeError: module '{module}' has no attribute '{path}'"
        ))),
    }
}

/// Whether a module function must be awaited by guest code.
pub fn is_async_module_fn(module: &str, path: &str) -> bool {
    matches!((module, path), ("asyncio", "sleep"))
}

/// Invoke a module function with already-evaluated arguments.
///
/// Internally async so that blocking-looking calls (`time.sleep`) still
/// suspend cooperatively.
pub async fn call_module_fn(
    module: &str,
    path: &str,
    args: Vec<Value>,
    rng: &mut u64,
    started: std::time::Instant,
) -> Result<Value, SandboxError> {
    let arity_error = |expected: &str| {
        SandboxError::Runtime(format!(
            "TypeError: {module}.{path}() expects {expected} argument(s), got {}",
            args.len()
        ))
    };
    let number = |value: &Value, position: usize| {
        value.as_number().ok_or_else(|| {
            SandboxError::Runtime(format!(
                "TypeError: {module}.{path}() argument {position} must be a number, \
                 not {}",
                value.type_name()
            ))
        })
    };

    match (module, path) {
        ("math", unary @ ("sqrt" | "floor" | "ceil" | "sin" | "cos" | "tan" | "log10" | "exp" | "fabs")) => {
            let [x] = args.as_slice() else {
                return Err(arity_error("1"));
            };
            let x = number(x, 1)?;
            let out = match unary {
                "sqrt" => {
                    if x < 0.0 {
                        return Err(SandboxError::Runtime(
                            "ValueError: math domain error".into(),
                        ));
                    }
                    x.sqrt()
                }
                "floor" => return Ok(Value::Int(x.floor() as i64)),
                "ceil" => return Ok(Value::Int(x.ceil() as i64)),
                "sin" => x.sin(),
                "cos" => x.cos(),
                "tan" => x.tan(),
                "log10" => x.log10(),
                "exp" => x.exp(),
                "fabs" => x.abs(),
                _ => unreachable!(),
            };
            Ok(Value::Float(out))
        }
        ("math", "log") => match args.as_slice() {
            [x] => Ok(Value::Float(number(x, 1)?.ln())),
            [x, base] => Ok(Value::Float(number(x, 1)?.log(number(base, 2)?))),
            _ => Err(arity_error("1 or 2")),
        },
        ("math", "pow") => match args.as_slice() {
            [x, y] => Ok(Value::Float(number(x, 1)?.powf(number(y, 2)?))),
            _ => Err(arity_error("2")),
        },
        ("math", "factorial") => match args.as_slice() {
            [Value::Int(n)] if *n >= 0 => {
                let mut acc: i64 = 1;
                for i in 2..=*n {
                    acc = acc.checked_mul(i).ok_or_else(|| {
                        SandboxError::Runtime("OverflowError: factorial result too large".into())
                    })?;
                }
                Ok(Value::Int(acc))
            }
            _ => Err(SandboxError::Runtime(
                "ValueError: factorial() requires a non-negative int".into(),
            )),
        },

        ("random", "random") => Ok(Value::Float(next_float(rng))),
        ("random", "uniform") => match args.as_slice() {
            [a, b] => {
                let (a, b) = (number(a, 1)?, number(b, 2)?);
                Ok(Value::Float(a + (b - a) * next_float(rng)))
            }
            _ => Err(arity_error("2")),
        },
        ("random", "randint") => match args.as_slice() {
            [Value::Int(a), Value::Int(b)] if a <= b => {
                let span = (*b - *a + 1) as u64;
                Ok(Value::Int(a + (next_u64(rng) % span) as i64))
            }
            _ => Err(SandboxError::Runtime(
                "ValueError: randint() requires int bounds with a <= b".into(),
            )),
        },
        ("random", "choice") => match args.as_slice() {
            [Value::List(items)] => {
                let items = items.lock();
                if items.is_empty() {
                    return Err(SandboxError::Runtime(
                        "IndexError: cannot choose from an empty sequence".into(),
                    ));
                }
                Ok(items[(next_u64(rng) % items.len() as u64) as usize].clone())
            }
            _ => Err(SandboxError::Runtime(
                "TypeError: choice() requires a list".into(),
            )),
        },
        ("random", "shuffle") => match args.as_slice() {
            [Value::List(items)] => {
                let mut items = items.lock();
                let n = items.len();
                for i in (1..n).rev() {
                    let j = (next_u64(rng) % (i as u64 + 1)) as usize;
                    items.swap(i, j);
                }
                Ok(Value::None)
            }
            _ => Err(SandboxError::Runtime(
                "TypeError: shuffle() requires a list".into(),
            )),
        },

        ("time", "time") => Ok(Value::Float(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        )),
        ("time", "perf_counter" | "monotonic") => {
            Ok(Value::Float(started.elapsed().as_secs_f64()))
        }
        ("time", "sleep") | ("asyncio", "sleep") => match args.as_slice() {
            [duration] => {
                // Sleeps are capped at one day.
                let requested = number(duration, 1)?;
                let secs = if requested.is_finite() {
                    requested.clamp(0.0, 86_400.0)
                } else {
                    0.0
                };
                tokio::time::sleep(std::time::Duration::from_secs_f64(secs)).await;
                Ok(Value::None)
            }
            _ => Err(arity_error("1")),
        },

        ("datetime", "datetime.now") => {
            Ok(Value::Str(Local::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()))
        }
        ("datetime", "datetime.utcnow") => {
            Ok(Value::Str(Utc::now().format("%Y-%m-%d %H:%M:%S%.6f").to_string()))
        }
        ("datetime", "date.today") => {
            Ok(Value::Str(Local::now().format("%Y-%m-%d").to_string()))
        }
        ("datetime", "datetime" | "date") => Err(SandboxError::Runtime(format!(
            "TypeError: constructing {module}.{path} objects directly is not supported; \
             call .now() or .today()"
        ))),

        ("asyncio", other) => Err(SandboxError::Runtime(format!(
            "NotImplementedError: asyncio.{other} is not available in the sandbox"
        ))),
        _ => Err(SandboxError::Runtime(format!(
            "AttributeError: '{module}.{path}' is not callable"
        ))),
    }
}

/// Seed for the guest `random` module.
pub fn seed_rng() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
        .unwrap_or(0x9E37_79B9)
        | 1
}

fn next_u64(state: &mut u64) -> u64 {
    // xorshift64*
    let mut x = *state;
    x ^= x >> 12;
    x ^= x << 25;
    x ^= x >> 27;
    *state = x;
    x.wrapping_mul(0x2545_F491_4F6C_DD1D)
}

fn next_float(state: &mut u64) -> f64 {
    (next_u64(state) >> 11) as f64 / (1u64 << 53) as f64
}
