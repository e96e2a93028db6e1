pub mod preprocessor;
pub mod validator;

pub use preprocessor::{ImagePreprocessor, ImageSource, ImageTensor, LoadedImage};
pub use validator::{get_image_info, validate_extension, validate_file_size, ImageInfo, ImageValidator};
