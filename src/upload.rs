//! Extracción de texto de los ficheros subidos (PDF o TXT).

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

/// Tipos de fichero admitidos.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    Pdf,
    Text,
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Tipo de fichero no soportado: '{0}'. Sólo se admiten .pdf y .txt")]
    UnsupportedType(String),
    #[error("El fichero de texto no está en UTF-8")]
    InvalidUtf8,
    #[error("No se pudo extraer texto del PDF: {0}")]
    Pdf(String),
}

/// Respuesta de la subida: metadatos más el texto extraído.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedDocument {
    pub file_id: String,
    pub file_name: String,
    pub file_size: usize,
    pub text: String,
}

/// Decide el tipo por extensión, con `mime_guess` como respaldo.
pub fn classify(file_name: &str) -> Result<UploadKind, UploadError> {
    let extension = std::path::Path::new(file_name)
        .extension()
        .and_then(std::ffi::OsStr::to_str)
        .unwrap_or("")
        .to_lowercase();

    match extension.as_str() {
        "pdf" => return Ok(UploadKind::Pdf),
        "txt" => return Ok(UploadKind::Text),
        _ => {}
    }

    match mime_guess::from_path(file_name).first() {
        Some(mime) if mime.essence_str() == "application/pdf" => Ok(UploadKind::Pdf),
        Some(mime) if mime.essence_str() == "text/plain" => Ok(UploadKind::Text),
        _ => Err(UploadError::UnsupportedType(extension)),
    }
}

/// Extrae el texto del contenido según su tipo. La extracción de PDF es
/// costosa: llamar desde `spawn_blocking`.
pub fn extract_text(kind: UploadKind, bytes: &[u8]) -> Result<String, UploadError> {
    match kind {
        UploadKind::Pdf => pdf_extract::extract_text_from_mem(bytes).map_err(|e| {
            warn!("No se pudo extraer texto del PDF: {}", e);
            UploadError::Pdf(e.to_string())
        }),
        UploadKind::Text => String::from_utf8(bytes.to_vec()).map_err(|_| UploadError::InvalidUtf8),
    }
}

/// Clasifica, extrae y empaqueta la respuesta de subida.
pub async fn process_upload(file_name: String, bytes: Vec<u8>) -> Result<UploadedDocument, UploadError> {
    let kind = classify(&file_name)?;
    let file_size = bytes.len();

    let text = tokio::task::spawn_blocking(move || extract_text(kind, &bytes))
        .await
        .map_err(|e| UploadError::Pdf(e.to_string()))??;

    info!(
        "Fichero '{}' procesado: {} bytes, {} caracteres de texto",
        file_name,
        file_size,
        text.chars().count()
    );

    Ok(UploadedDocument {
        file_id: Uuid::new_v4().to_string(),
        file_name,
        file_size,
        text,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_by_extension_case_insensitively() {
        assert_eq!(classify("apuntes.PDF").unwrap(), UploadKind::Pdf);
        assert_eq!(classify("notas.txt").unwrap(), UploadKind::Text);
        assert!(matches!(
            classify("foto.png"),
            Err(UploadError::UnsupportedType(ext)) if ext == "png"
        ));
        assert!(classify("sin_extension").is_err());
    }

    #[test]
    fn text_must_be_utf8() {
        assert_eq!(extract_text(UploadKind::Text, "网络基础".as_bytes()).unwrap(), "网络基础");
        assert!(matches!(
            extract_text(UploadKind::Text, &[0xff, 0xfe, 0x00]),
            Err(UploadError::InvalidUtf8)
        ));
    }

    #[tokio::test]
    async fn process_upload_reports_size_and_text() {
        let doc = process_upload("clase.txt".into(), b"OSI\nTCP/IP".to_vec())
            .await
            .unwrap();
        assert_eq!(doc.file_name, "clase.txt");
        assert_eq!(doc.file_size, 10);
        assert_eq!(doc.text, "OSI\nTCP/IP");
        assert!(!doc.file_id.is_empty());
    }
}
