//! Indentation-aware text sink for emitted device code

const INDENT: &str = "    ";

/// Accumulates generated source with a current indentation depth
#[derive(Debug, Default, Clone)]
pub struct CodeWriter {
    buf: String,
    depth: usize,
}

impl CodeWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_depth(depth: usize) -> Self {
        Self {
            buf: String::new(),
            depth,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Write one line at the current depth; an empty line carries no indentation
    pub fn line(&mut self, text: impl AsRef<str>) -> &mut Self {
        let text = text.as_ref();
        if !text.is_empty() {
            for _ in 0..self.depth {
                self.buf.push_str(INDENT);
            }
            self.buf.push_str(text);
        }
        self.buf.push('\n');
        self
    }

    pub fn lines<I, S>(&mut self, lines: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for line in lines {
            self.line(line);
        }
        self
    }

    pub fn blank(&mut self) -> &mut Self {
        self.buf.push('\n');
        self
    }

    /// Write `header {` and indent
    pub fn open(&mut self, header: impl AsRef<str>) -> &mut Self {
        self.line(format!("{} {{", header.as_ref()));
        self.depth += 1;
        self
    }

    /// Close the current block with `}`
    pub fn close(&mut self) -> &mut Self {
        self.depth = self.depth.saturating_sub(1);
        self.line("}")
    }

    /// Close the current block and open a continuation, e.g. `} else {`
    pub fn reopen(&mut self, middle: impl AsRef<str>) -> &mut Self {
        self.depth = self.depth.saturating_sub(1);
        self.line(format!("}} {} {{", middle.as_ref()));
        self.depth += 1;
        self
    }

    /// Append pre-formatted text, indenting every non-empty line to the current depth
    pub fn block(&mut self, text: &str) -> &mut Self {
        for line in text.lines() {
            self.line(line);
        }
        self
    }

    pub fn as_str(&self) -> &str {
        &self.buf
    }

    pub fn finish(self) -> String {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_blocks() {
        let mut w = CodeWriter::new();
        w.open("if ASCEND_IS_AIV");
        w.open("if (AscendC::GetBlockIdx() < 8)");
        w.line("add_kernel(1);");
        w.reopen("else");
        w.line("AscendC::SuperKernelAutoSyncAllComplementImpl();");
        w.close();
        w.close();
        insta::assert_snapshot!(w.finish(), @r###"
        if ASCEND_IS_AIV {
            if (AscendC::GetBlockIdx() < 8) {
                add_kernel(1);
            } else {
                AscendC::SuperKernelAutoSyncAllComplementImpl();
            }
        }
        "###);
    }

    #[test]
    fn test_block_keeps_blank_lines_unindented() {
        let mut w = CodeWriter::with_depth(1);
        w.block("a();\n\nb();");
        assert_eq!(w.as_str(), "    a();\n\n    b();\n");
    }
}
