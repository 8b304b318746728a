//! Small arithmetic toolbox.
//!
//! Handy for demos and exercised heavily by the scenario tests; registered
//! under the `math` toolbox by default.

use std::sync::Arc;

use serde_json::json;

use super::{kwarg_f64, kwarg_i64, kwarg_str, FunctionTool, Tool, ToolArgument, ToolKwargs};

/// All tools of the math toolbox.
pub fn get_tools() -> Vec<Arc<dyn Tool>> {
    vec![add(), multiply(), sin(), cos(), concat()]
}

fn add() -> Arc<dyn Tool> {
    FunctionTool::builder("add", |kwargs: ToolKwargs| async move {
        let a = kwarg_i64(&kwargs, "a")?;
        let b = kwarg_i64(&kwargs, "b")?;
        Ok(json!(a + b))
    })
    .toolbox("math")
    .description("Adds two numbers and returns the sum.")
    .argument(ToolArgument::required("a", "int", "First number to add"))
    .argument(ToolArgument::required("b", "int", "Second number to add"))
    .return_type("int")
    .build()
}

fn multiply() -> Arc<dyn Tool> {
    FunctionTool::builder("multiply", |kwargs: ToolKwargs| async move {
        let x = kwarg_i64(&kwargs, "x")?;
        let y = kwarg_i64(&kwargs, "y")?;
        Ok(json!(x * y))
    })
    .toolbox("math")
    .description("Multiplies two numbers and returns the product.")
    .argument(ToolArgument::required("x", "int", "First factor"))
    .argument(ToolArgument::required("y", "int", "Second factor"))
    .return_type("int")
    .build()
}

fn sin() -> Arc<dyn Tool> {
    FunctionTool::builder("sin", |kwargs: ToolKwargs| async move {
        let radians = kwarg_f64(&kwargs, "radians")?;
        Ok(json!(radians.sin()))
    })
    .toolbox("math")
    .description("Calculates the sine of an angle given in radians.")
    .argument(ToolArgument::required(
        "radians",
        "float",
        "Angle in radians",
    ))
    .return_type("float")
    .build()
}

fn cos() -> Arc<dyn Tool> {
    FunctionTool::builder("cos", |kwargs: ToolKwargs| async move {
        let radians = kwarg_f64(&kwargs, "radians")?;
        Ok(json!(radians.cos()))
    })
    .toolbox("math")
    .description("Calculates the cosine of an angle given in radians.")
    .argument(ToolArgument::required(
        "radians",
        "float",
        "Angle in radians",
    ))
    .return_type("float")
    .build()
}

fn concat() -> Arc<dyn Tool> {
    FunctionTool::builder("concat", |kwargs: ToolKwargs| async move {
        let first = kwarg_str(&kwargs, "first")?;
        let second = kwarg_str(&kwargs, "second")?;
        Ok(json!(format!("{first}{second}")))
    })
    .toolbox("math")
    .description("Concatenates two strings.")
    .argument(ToolArgument::required("first", "string", "First string"))
    .argument(ToolArgument::required("second", "string", "Second string"))
    .return_type("string")
    .build()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_multiply() {
        let tool = multiply();
        let mut kwargs = ToolKwargs::new();
        kwargs.insert("x".into(), json!(6));
        kwargs.insert("y".into(), json!(7));
        assert_eq!(tool.async_execute(kwargs).await.unwrap(), json!(42));
    }

    #[tokio::test]
    async fn test_sin_of_zero() {
        let tool = sin();
        let mut kwargs = ToolKwargs::new();
        kwargs.insert("radians".into(), json!(0.0));
        assert_eq!(tool.async_execute(kwargs).await.unwrap(), json!(0.0));
    }

    #[test]
    fn test_toolbox_is_math_for_all() {
        for tool in get_tools() {
            assert_eq!(tool.toolbox_name(), "math");
        }
    }
}
