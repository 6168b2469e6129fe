// OCR Service Module - Text recognition on binarized nutrition panels
//
// Tesseract (via leptess) with a domain-trained language model and a character
// whitelist; the auxiliary word/pattern lists correct the engine output. The
// backend is behind the `TextRecognizer` trait so the pipeline can run with
// test doubles.

pub mod lexicon;

pub use lexicon::Lexicon;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::config::RecognitionConfig;
use crate::core::errors::{RecognitionResult, StartupError};
use crate::core::types::PreparedCrop;

/// Every character the recognizer may emit (newlines separate lines)
pub const CHAR_WHITELIST: &str =
    "0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ%(),./:;*<>-_= ";

/// Recognizes printed text on a prepared crop
pub trait TextRecognizer: Send + Sync {
    /// Raw text, possibly empty
    fn recognize(&self, crop: &PreparedCrop) -> RecognitionResult<String>;
}

/// Drop characters outside the whitelist and blank lines
pub fn sanitize(raw: &str) -> String {
    raw.lines()
        .map(|line| {
            line.chars()
                .filter(|c| CHAR_WHITELIST.contains(*c))
                .collect::<String>()
        })
        .map(|line| line.trim().to_string())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Resolved recognition resources
#[derive(Debug, Clone)]
pub struct RecognitionResources {
    pub tessdata_dir: PathBuf,
    pub language: String,
    /// None when the file was missing at startup
    pub user_words: Option<PathBuf>,
    pub user_patterns: Option<PathBuf>,
    pub lexicon: Lexicon,
    pub page_seg_mode: u32,
}

/// Verify recognition resources at startup
///
/// The trained language model is required; the word and pattern lists only
/// improve accuracy, so their absence is logged and tolerated.
pub fn check_resources(config: &RecognitionConfig) -> Result<RecognitionResources, StartupError> {
    let tessdata_dir = PathBuf::from(&config.tessdata_dir);
    let traineddata = tessdata_dir.join(format!("{}.traineddata", config.language));

    if !traineddata.is_file() {
        return Err(StartupError::ModelUnavailable {
            artifact: "recognizer",
            path: traineddata.display().to_string(),
            reason: "trained language data not found".to_string(),
        });
    }

    let optional = |path: &str, what: &str| -> Option<PathBuf> {
        let path = Path::new(path);
        if path.is_file() {
            Some(path.to_path_buf())
        } else {
            warn!(
                "OCR {} file not found at {}; recognition accuracy will be reduced",
                what,
                path.display()
            );
            None
        }
    };

    let user_words = optional(&config.user_words_file, "user-words");
    let user_patterns = optional(&config.user_patterns_file, "user-patterns");
    let lexicon = Lexicon::load(user_words.as_deref(), user_patterns.as_deref());

    let resources = RecognitionResources {
        tessdata_dir,
        language: config.language.clone(),
        user_words,
        user_patterns,
        lexicon,
        page_seg_mode: config.page_seg_mode,
    };

    info!(
        "OCR resources: language={}, words={}, patterns={}",
        resources.language,
        resources.lexicon.word_count(),
        resources.lexicon.pattern_count()
    );
    Ok(resources)
}

#[cfg(feature = "tesseract")]
mod tesseract {
    use super::*;
    use crate::core::errors::RecognitionError;
    use leptess::{LepTess, Variable};
    use std::io::Cursor;
    use tracing::debug;

    /// Tesseract-backed recognizer
    ///
    /// A fresh engine is created per call; leptess handles are not shareable
    /// across threads.
    pub struct TesseractRecognizer {
        resources: RecognitionResources,
    }

    impl TesseractRecognizer {
        pub fn new(resources: RecognitionResources) -> Result<Self, StartupError> {
            // Verify Tesseract can initialize with the domain language
            Self::engine(&resources).map_err(|e| StartupError::ModelUnavailable {
                artifact: "recognizer",
                path: resources.tessdata_dir.display().to_string(),
                reason: e.to_string(),
            })?;
            Ok(Self { resources })
        }

        fn engine(resources: &RecognitionResources) -> RecognitionResult<LepTess> {
            let datapath = resources.tessdata_dir.to_string_lossy();
            let mut lt = LepTess::new(Some(datapath.as_ref()), &resources.language).map_err(|e| {
                RecognitionError::ModelUnavailable {
                    path: format!("{} ({})", datapath, e),
                }
            })?;

            let set = |lt: &mut LepTess, var: Variable, name: &str, value: &str| {
                lt.set_variable(var, value)
                    .map_err(|e| RecognitionError::EngineFailed(format!("{}: {}", name, e)))
            };

            // Default engine mode; single uniform block
            set(
                &mut lt,
                Variable::TesseditPagesegMode,
                "tessedit_pageseg_mode",
                &resources.page_seg_mode.to_string(),
            )?;
            set(
                &mut lt,
                Variable::TesseditCharWhitelist,
                "tessedit_char_whitelist",
                CHAR_WHITELIST,
            )?;

            Ok(lt)
        }
    }

    impl TextRecognizer for TesseractRecognizer {
        fn recognize(&self, crop: &PreparedCrop) -> RecognitionResult<String> {
            let mut lt = Self::engine(&self.resources)?;

            // leptess expects encoded image data
            let mut png = Cursor::new(Vec::new());
            crop.image.write_to(&mut png, image::ImageFormat::Png)?;

            lt.set_image_from_mem(png.get_ref())
                .map_err(|e| RecognitionError::EngineFailed(format!("set image: {}", e)))?;

            let raw = lt
                .get_utf8_text()
                .map_err(|e| RecognitionError::EngineFailed(format!("get text: {}", e)))?;

            let text = sanitize(&self.resources.lexicon.correct_text(&raw));
            debug!("Recognized {} chars ({} raw)", text.len(), raw.len());
            Ok(text)
        }
    }
}

#[cfg(feature = "tesseract")]
pub use tesseract::TesseractRecognizer;

/// Build the configured recognizer; failure is fatal for the service
pub fn build_recognizer(config: &RecognitionConfig) -> Result<Arc<dyn TextRecognizer>, StartupError> {
    let resources = check_resources(config)?;

    #[cfg(feature = "tesseract")]
    {
        let recognizer = TesseractRecognizer::new(resources)?;
        info!("✓ OCR: Tesseract ({})", config.language);
        Ok(Arc::new(recognizer))
    }

    #[cfg(not(feature = "tesseract"))]
    {
        Err(StartupError::ModelUnavailable {
            artifact: "recognizer",
            path: resources.tessdata_dir.display().to_string(),
            reason: "built without the `tesseract` feature; rebuild with --features tesseract"
                .to_string(),
        })
    }
}
