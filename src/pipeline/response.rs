//! The response channel the pipeline emits end-user pages on.

use std::io::{self, Write};

/// Status set on a response that ends in an error page.
pub const ERROR_STATUS: u16 = 500;

/// Where rendered pages go when the pipeline is not in return mode.
pub trait ResponseSink {
    /// True once any body byte has been sent; the status can no longer change.
    fn is_committed(&self) -> bool;

    fn set_status(&mut self, status: u16);

    fn emit(&mut self, body: &[u8]) -> io::Result<()>;
}

impl<S: ResponseSink + ?Sized> ResponseSink for &mut S {
    fn is_committed(&self) -> bool {
        (**self).is_committed()
    }

    fn set_status(&mut self, status: u16) {
        (**self).set_status(status)
    }

    fn emit(&mut self, body: &[u8]) -> io::Result<()> {
        (**self).emit(body)
    }
}

/// Wraps the outbound writer and tracks status and commitment.
#[derive(Debug)]
pub struct ResponseWriter<W: Write> {
    inner: W,
    status: Option<u16>,
    committed: bool,
}

impl<W: Write> ResponseWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            status: None,
            committed: false,
        }
    }

    /// Status explicitly set on the response, if any.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for ResponseWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        if written > 0 {
            self.committed = true;
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl<W: Write> ResponseSink for ResponseWriter<W> {
    fn is_committed(&self) -> bool {
        self.committed
    }

    fn set_status(&mut self, status: u16) {
        if self.committed {
            tracing::debug!(status, "response already committed, status not changed");
            return;
        }
        self.status = Some(status);
    }

    fn emit(&mut self, body: &[u8]) -> io::Result<()> {
        self.write_all(body)?;
        self.flush()
    }
}
