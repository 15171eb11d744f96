// Error accumulation for cleanup paths: a teardown failure must never hide
// the step failure that preceded it, and vice versa.

use std::fmt;

/// Several errors that all occurred while handling one job.
#[derive(Debug, Default)]
pub struct ErrorList {
    errors: Vec<anyhow::Error>,
}

impl ErrorList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: anyhow::Error) {
        match err.downcast::<ErrorList>() {
            Ok(list) => self.errors.extend(list.errors),
            Err(err) => self.errors.push(err),
        }
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[anyhow::Error] {
        &self.errors
    }

    /// Collapse into a single error: `None` when empty, the error itself when
    /// there is exactly one, the list otherwise.
    pub fn into_result(mut self) -> Result<(), anyhow::Error> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(self.into()),
        }
    }
}

impl fmt::Display for ErrorList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n\t* {err:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorList {}

/// Append `new` to whatever error already exists, never discarding either.
pub fn append(existing: Option<anyhow::Error>, new: anyhow::Error) -> anyhow::Error {
    match existing {
        None => new,
        Some(existing) => {
            let mut list = ErrorList::new();
            list.push(existing);
            list.push(new);
            list.into()
        }
    }
}

/// Fold a cleanup outcome into the running result of a job.
pub fn combine(result: anyhow::Result<()>, cleanup: anyhow::Result<()>) -> anyhow::Result<()> {
    match (result, cleanup) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(err), Ok(())) | (Ok(()), Err(err)) => Err(err),
        (Err(err), Err(cleanup)) => Err(append(Some(err), cleanup)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    #[test]
    fn append_to_nothing_is_identity() {
        let err = append(None, anyhow!("boom"));
        assert_eq!(err.to_string(), "boom");
        assert!(err.downcast_ref::<ErrorList>().is_none());
    }

    #[test]
    fn append_keeps_both_errors() {
        let err = append(Some(anyhow!("step failed")), anyhow!("teardown failed"));
        let list = err.downcast_ref::<ErrorList>().unwrap();
        assert_eq!(list.len(), 2);
        let text = err.to_string();
        assert!(text.contains("step failed"));
        assert!(text.contains("teardown failed"));
    }

    #[test]
    fn append_flattens_nested_lists() {
        let err = append(Some(anyhow!("a")), anyhow!("b"));
        let err = append(Some(err), anyhow!("c"));
        assert_eq!(err.downcast_ref::<ErrorList>().unwrap().len(), 3);
    }

    #[test]
    fn combine_prefers_existing_error_and_appends_cleanup() {
        assert!(combine(Ok(()), Ok(())).is_ok());
        assert_eq!(
            combine(Err(anyhow!("x")), Ok(())).unwrap_err().to_string(),
            "x"
        );
        let err = combine(Err(anyhow!("x")), Err(anyhow!("y"))).unwrap_err();
        assert!(err.to_string().starts_with("2 errors occurred:"));
    }

    #[test]
    fn display_preserves_context_chain() {
        let inner = anyhow!("disk full").context("failed to remove workspace");
        let err = append(Some(anyhow!("boom")), inner);
        assert!(err.to_string().contains("failed to remove workspace: disk full"));
    }

    #[test]
    fn into_result_collapses_single_error() {
        let mut list = ErrorList::new();
        assert!(ErrorList::new().into_result().is_ok());
        list.push(anyhow!("only"));
        assert_eq!(list.into_result().unwrap_err().to_string(), "only");
    }
}
