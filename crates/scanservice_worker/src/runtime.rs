//! Child side of the worker protocol: answer calls read from stdin.

use crate::analyzer::AnalyzerRegistry;
use scanservice_protocol::{
    AnalyzerCall, FailureKind, FailurePayload, Frame, OpCode, ProtocolError,
};
use std::io::{BufReader, BufWriter, Read, Write};
use tracing::{debug, info, warn};

/// Serve calls until the reader reaches end of stream. Returns the number
/// of calls answered.
pub fn serve<R: Read, W: Write>(
    mut reader: R,
    mut writer: W,
    registry: &AnalyzerRegistry,
) -> Result<u64, ProtocolError> {
    let mut served = 0u64;
    while let Some(frame) = Frame::read_from(&mut reader)? {
        if frame.opcode() != OpCode::Call {
            return Err(ProtocolError::UnexpectedOpCode {
                expected: "Call",
                got: frame.opcode(),
            });
        }
        let call: AnalyzerCall = frame.decode()?;
        let reply = answer(frame.call_id(), &call, registry)?;
        reply.write_to(&mut writer)?;
        served += 1;
    }
    Ok(served)
}

fn answer(
    call_id: u64,
    call: &AnalyzerCall,
    registry: &AnalyzerRegistry,
) -> Result<Frame, ProtocolError> {
    let Some(analyzer) = registry.get(&call.analyzer) else {
        warn!(analyzer = %call.analyzer, "Unknown analyzer requested");
        return Frame::failed(
            call_id,
            &FailurePayload {
                analyzer: call.analyzer.clone(),
                message: format!("Unknown analyzer: {}", call.analyzer),
                kind: FailureKind::UnknownAnalyzer,
            },
        );
    };

    debug!(analyzer = %call.analyzer, path = %call.location.display(), "Running analyzer");
    match analyzer.scan(&call.location, call.deadline, &call.options) {
        Ok(mapping) => Frame::result(call_id, &mapping),
        Err(e) => Frame::failed(
            call_id,
            &FailurePayload {
                analyzer: call.analyzer.clone(),
                message: e.to_string(),
                kind: FailureKind::Analyzer,
            },
        ),
    }
}

/// Serve on this process's stdin/stdout.
pub fn serve_stdio(registry: &AnalyzerRegistry) -> anyhow::Result<()> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    info!(pid = std::process::id(), "Worker process ready");
    let served = serve(
        BufReader::new(stdin.lock()),
        BufWriter::new(stdout.lock()),
        registry,
    )?;
    info!(served, "Worker process input closed, exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanservice_protocol::{AnalyzerOptions, AttributeMapping, Deadline};
    use std::io::Cursor;
    use tempfile::TempDir;

    fn call(analyzer: &str, location: std::path::PathBuf) -> AnalyzerCall {
        AnalyzerCall {
            analyzer: analyzer.to_string(),
            location,
            deadline: Deadline::none(),
            options: AnalyzerOptions::default(),
        }
    }

    #[test]
    fn test_serve_answers_each_call_in_order() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("main.rs");
        std::fs::write(&path, "// SPDX-License-Identifier: MIT\nfn main() {}\n").unwrap();

        let mut input = Vec::new();
        Frame::call(1, &call("licenses", path.clone()))
            .unwrap()
            .write_to(&mut input)
            .unwrap();
        Frame::call(2, &call("packages", path.clone()))
            .unwrap()
            .write_to(&mut input)
            .unwrap();
        Frame::call(3, &call("licenses", temp.path().join("missing.rs")))
            .unwrap()
            .write_to(&mut input)
            .unwrap();

        let mut output = Vec::new();
        let served = serve(Cursor::new(input), &mut output, &AnalyzerRegistry::builtin()).unwrap();
        assert_eq!(served, 3);

        let mut replies = Cursor::new(output);
        let first = Frame::read_from(&mut replies).unwrap().unwrap();
        assert_eq!(first.opcode(), OpCode::Result);
        assert_eq!(first.call_id(), 1);
        let mapping: AttributeMapping = first.decode().unwrap();
        assert_eq!(mapping.detected_license_expression.as_deref(), Some("mit"));

        let second = Frame::read_from(&mut replies).unwrap().unwrap();
        assert_eq!(second.opcode(), OpCode::Failed);
        let failure: FailurePayload = second.decode().unwrap();
        assert_eq!(failure.kind, FailureKind::UnknownAnalyzer);

        let third = Frame::read_from(&mut replies).unwrap().unwrap();
        assert_eq!(third.call_id(), 3);
        let failure: FailurePayload = third.decode().unwrap();
        assert_eq!(failure.kind, FailureKind::Analyzer);
        assert!(failure.message.contains("missing.rs"));

        assert!(Frame::read_from(&mut replies).unwrap().is_none());
    }

    #[test]
    fn test_serve_rejects_reply_frames() {
        let mut input = Vec::new();
        Frame::result(1, &AttributeMapping::default())
            .unwrap()
            .write_to(&mut input)
            .unwrap();

        let err = serve(Cursor::new(input), Vec::new(), &AnalyzerRegistry::builtin()).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedOpCode { .. }));
    }
}
