pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use bbox::{prelude::*, BoxDelta, CxCyWH, XYXY};
pub use derivative::Derivative;
pub use getset::{CopyGetters, Getters};
pub use itertools::{iproduct, izip, Itertools as _};
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use rand::{prelude::*, rngs::StdRng};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::Borrow,
    cmp::Ordering,
    collections::{HashMap, HashSet},
    convert::TryFrom,
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};
pub use tch::{nn, Device, IndexOp, Kind, Reduction, Tensor};
pub use tch_tensor_like::TensorLike;
