use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Output;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, trace};
use tokio::process::Command;

use super::{ProverInput, ProvingBackend, VerificationKey};
use crate::types::{Groth16Proof, Proof};
use crate::{Error, Result};

/// Drives the `snarkjs` command line tool.
///
/// `program` plus `leading_args` is the snarkjs invocation, e.g. `snarkjs`
/// with no arguments or `npx` with `["snarkjs"]`.
#[derive(Debug, Clone)]
pub struct SnarkjsBackend {
    program: PathBuf,
    leading_args: Vec<OsString>,
    wasm_file: PathBuf,
    zkey_file: PathBuf,
    timeout: Duration,
}

impl SnarkjsBackend {
    pub fn new(
        program: impl Into<PathBuf>,
        leading_args: Vec<OsString>,
        wasm_file: impl Into<PathBuf>,
        zkey_file: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            leading_args,
            wasm_file: wasm_file.into(),
            zkey_file: zkey_file.into(),
            timeout,
        }
    }

    async fn run(&self, args: &[&Path]) -> Result<Output> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.leading_args).args(args).kill_on_drop(true);
        trace!("running {:?}", cmd);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::Network(format!("snarkjs timed out after {:?}", self.timeout)))?
            .map_err(|e| {
                Error::Network(format!("failed to run {}: {}", self.program.display(), e))
            })?;
        Ok(output)
    }
}

fn scratch_dir() -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("zk-relay-")
        .tempdir()
        .map_err(|e| Error::Network(format!("failed to create scratch dir: {}", e)))
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    std::fs::write(path, bytes)
        .map_err(|e| Error::Network(format!("failed to write {}: {}", path.display(), e)))
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read(path)
        .map_err(|e| Error::Proof(format!("snarkjs produced no {}: {}", path.display(), e)))?;
    serde_json::from_slice(&raw)
        .map_err(|e| Error::Proof(format!("unreadable {}: {}", path.display(), e)))
}

fn describe(output: &Output) -> String {
    let stderr = String::from_utf8_lossy(&output.stderr);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let text = if stderr.trim().is_empty() { stdout } else { stderr };
    format!("{} ({})", text.trim(), output.status)
}

#[async_trait]
impl ProvingBackend for SnarkjsBackend {
    async fn full_prove(&self, input: &ProverInput) -> Result<Proof> {
        let dir = scratch_dir()?;
        let input_path = dir.path().join("input.json");
        let proof_path = dir.path().join("proof.json");
        let public_path = dir.path().join("public.json");
        write_json(&input_path, input)?;

        let output = self
            .run(&[
                Path::new("groth16"),
                Path::new("fullprove"),
                &input_path,
                &self.wasm_file,
                &self.zkey_file,
                &proof_path,
                &public_path,
            ])
            .await?;
        if !output.status.success() {
            return Err(Error::Proof(format!("fullprove failed: {}", describe(&output))));
        }

        let proof: Groth16Proof = read_json(&proof_path)?;
        let public_signals: Vec<String> = read_json(&public_path)?;
        debug!("fullprove produced {} public signals", public_signals.len());
        Ok(Proof {
            proof,
            public_signals,
        })
    }

    async fn verify(&self, key: &VerificationKey, proof: &Proof) -> Result<bool> {
        let dir = scratch_dir()?;
        let key_path = dir.path().join("verification_key.json");
        let proof_path = dir.path().join("proof.json");
        let public_path = dir.path().join("public.json");
        write_json(&key_path, key)?;
        write_json(
            &proof_path,
            &serde_json::json!({
                "pi_a": proof.proof.pi_a,
                "pi_b": proof.proof.pi_b,
                "pi_c": proof.proof.pi_c,
                "protocol": "groth16",
                "curve": "bn128",
            }),
        )?;
        write_json(&public_path, &proof.public_signals)?;

        let output = self
            .run(&[
                Path::new("groth16"),
                Path::new("verify"),
                &key_path,
                &public_path,
                &proof_path,
            ])
            .await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if output.status.success() && stdout.contains("OK") {
            return Ok(true);
        }
        if stdout.contains("Invalid proof") {
            return Ok(false);
        }
        Err(Error::Proof(format!("verify failed: {}", describe(&output))))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    const FAKE_SNARKJS: &str = r#"
case "$2" in
  fullprove)
    echo '{"pi_a":["1","2","1"],"pi_b":[["3","4"],["5","6"],["1","0"]],"pi_c":["7","8","1"],"protocol":"groth16","curve":"bn128"}' > "$6"
    echo '["1","2500"]' > "$7"
    ;;
  verify)
    if grep -q '"2500"' "$4"; then echo "[INFO]  snarkJS: OK!"; else echo "[ERROR] snarkJS: Invalid proof"; exit 1; fi
    ;;
  *) exit 2 ;;
esac
"#;

    fn backend(dir: &Path) -> SnarkjsBackend {
        let script = dir.join("snarkjs.sh");
        std::fs::write(&script, FAKE_SNARKJS).unwrap();
        SnarkjsBackend::new(
            "sh",
            vec![script.into_os_string()],
            dir.join("circuit.wasm"),
            dir.join("circuit.zkey"),
            Duration::from_secs(10),
        )
    }

    fn input() -> ProverInput {
        ProverInput {
            nonce: "1".into(),
            amount: "2500".into(),
            destination_address: "16".into(),
            destination_chain_id: "2".into(),
            source_chain_id: "1".into(),
            source_bridge_address: "256".into(),
            dest_chain_id: "2".into(),
        }
    }

    #[tokio::test]
    async fn proves_and_verifies_through_cli() {
        let dir = tempfile::tempdir().unwrap();
        let backend = backend(dir.path());
        let proof = backend.full_prove(&input()).await.unwrap();
        assert_eq!(proof.proof.pi_b.len(), 3);
        assert_eq!(proof.public_signals, vec!["1", "2500"]);

        let key = VerificationKey(serde_json::json!({"protocol": "groth16"}));
        assert!(backend.verify(&key, &proof).await.unwrap());

        let mut tampered = proof.clone();
        tampered.public_signals[1] = "9999".into();
        assert!(!backend.verify(&key, &tampered).await.unwrap());
    }

    #[tokio::test]
    async fn missing_binary_is_transient() {
        let backend = SnarkjsBackend::new(
            "/nonexistent/snarkjs",
            vec![],
            "c.wasm",
            "c.zkey",
            Duration::from_secs(1),
        );
        let err = backend.full_prove(&input()).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }
}
