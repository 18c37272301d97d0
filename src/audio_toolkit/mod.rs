// Hardware audio layer: device enumeration, the cpal-backed recorder, and
// sample utilities shared by the capture pipeline.

pub mod device;
pub mod recorder;
pub mod resampler;
pub mod utils;

pub use device::{find_input_device, list_input_devices, CpalDeviceInfo};
pub use recorder::CpalInputFactory;
pub use resampler::ChunkResampler;
pub use utils::{encode_wav, rms, save_wav_file, TARGET_SAMPLE_RATE};
