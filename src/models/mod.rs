//! Model components: position encodings, preprocessors, the latent
//! encoder, decoders and postprocessors, plus the assembled task models.

pub mod attention;
pub mod decoder;
pub mod encoder;
pub mod modality;
pub mod model;
pub mod position;
pub mod postprocessor;
pub mod preprocessor;

pub use decoder::{
    BasicDecoder, BasicDecoderConfig, ClassificationDecoder, DecoderOutput, FlowDecoder,
    MultimodalDecoder, PerceiverDecoder, SubsampledPoints, VideoAutoencodingDecoder,
};
pub use encoder::{EncoderOutput, PerceiverEncoder};
pub use modality::{restructure, ModalitySizes};
pub use model::{
    ImageClassificationKind, MultimodalTaskOutput, PerceiverForImageClassification,
    PerceiverForMaskedLM, PerceiverForMultimodalAutoencoding, PerceiverForOpticalFlow,
    PerceiverModel, PerceiverModelOutput, TaskOutput,
};
pub use position::{
    build_position_encoding, FourierPositionEncoding, PositionEncoding, PositionEncodingConfig,
    TrainablePositionEncoding,
};
pub use postprocessor::{Postprocessor, PostprocessorOutput};
pub use preprocessor::{
    AudioPreprocessor, ConcatOrAdd, ImagePrepKind, ImagePreprocessor, ImagePreprocessorConfig,
    ModelInputs, MultimodalPreprocessor, OneHotPreprocessor, Preprocessor, TextPreprocessor,
};
