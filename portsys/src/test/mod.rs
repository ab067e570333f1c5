/*!
Test code that should only be compiled when running tests.
*/

use crate::archive::ZipTool;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

/// A stand-in archiver pair backed by tar, so tests do not depend on a zip
/// installation. The scripts accept the exact argument shapes [`ZipTool`]
/// produces.
pub(crate) fn fake_zip_tool(dir: &Path) -> ZipTool {
    let zip = dir.join("fake-zip");
    std::fs::write(&zip, "#!/bin/sh\ntar -cf \"$5\" .\n").unwrap();
    let unzip = dir.join("fake-unzip");
    std::fs::write(
        &unzip,
        "#!/bin/sh\nif [ \"$1\" = \"-t\" ]; then tar -tf \"$3\" >/dev/null;\nelse mkdir -p \"$5\" && tar -xf \"$3\" -C \"$5\"; fi\n",
    )
    .unwrap();
    for tool in [&zip, &unzip] {
        std::fs::set_permissions(tool, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    ZipTool::new(zip, unzip)
}
