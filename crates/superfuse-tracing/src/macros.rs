//! Convenience macros for stage tracing

/// Time a generator stage, optionally attaching fields to an enclosing debug span.
///
/// # Syntax
///
/// ```text
/// stage_span!("name")
/// stage_span!("name", field1 = value1, ...)
/// ```
///
/// # Example
///
/// ```rust
/// use superfuse_tracing::stage_span;
///
/// {
///     let _stage = stage_span!("emit", operators = 4);
///     // ... emit code ...
/// }
/// ```
#[macro_export]
macro_rules! stage_span {
    ($name:expr) => {{
        $crate::performance::StageSpan::new($name)
    }};
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {{
        $crate::debug!(stage = $name, $($field = $value),+, "stage_begin");
        $crate::performance::StageSpan::new($name)
    }};
}

/// Emit a debug event tagged with a generator stage.
///
/// # Example
///
/// ```rust
/// use superfuse_tracing::stage_event;
///
/// stage_event!("sync", rule = "rule2", operator = "add_0");
/// ```
#[macro_export]
macro_rules! stage_event {
    ($name:expr, $($field:tt = $value:expr),+ $(,)?) => {
        $crate::debug!(
            stage = $name,
            $($field = $value),+
        );
    };
}
